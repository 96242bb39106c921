//! Collective communication interface
//!
//! One logical process per mesh rank cooperates through these calls. Every
//! collective blocks the issuing rank until all members of its
//! [`ProcessGroup`] have contributed; groups are usually axis-scoped sub-groups
//! of the mesh (for example the tensor-parallel ranks sharing one dp/pp
//! coordinate), not the whole world.
//!
//! Backends implement [`Communicator::all_gather`] and point-to-point
//! [`send`](Communicator::send)/[`recv`](Communicator::recv); the reductions,
//! scatters and broadcast have default implementations on top of all-gather.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardplan_types::{Rank, Result, ShardplanError};
use std::fmt;

/// Reduction applied element-wise across group members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

/// Ordered set of global ranks taking part in a collective
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessGroup {
    ranks: Vec<Rank>,
}

impl ProcessGroup {
    /// Create a group from ranks in group order
    pub fn new(ranks: Vec<Rank>) -> Self {
        Self { ranks }
    }

    /// Group containing every rank of a world
    pub fn world(world_size: usize) -> Self {
        Self::new((0..world_size).collect())
    }

    /// Member ranks in group order
    pub fn ranks(&self) -> &[Rank] {
        &self.ranks
    }

    /// Number of members
    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Position of `rank` inside the group
    pub fn index_of(&self, rank: Rank) -> Option<usize> {
        self.ranks.iter().position(|r| *r == rank)
    }

    /// Check if `rank` is a member
    pub fn contains(&self, rank: Rank) -> bool {
        self.index_of(rank).is_some()
    }

    /// A group of one needs no communication
    pub fn is_trivial(&self) -> bool {
        self.ranks.len() <= 1
    }
}

impl fmt::Display for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.ranks)
    }
}

/// Reduce gathered contributions into `out`
pub fn reduce_parts(out: &mut [f32], parts: &[Vec<f32>], op: ReduceOp) -> Result<()> {
    if parts.is_empty() {
        return Err(ShardplanError::communication("reduction over an empty group"));
    }
    if let Some(bad) = parts.iter().find(|p| p.len() != out.len()) {
        return Err(ShardplanError::communication(format!(
            "reduction length mismatch: expected {}, got {}",
            out.len(),
            bad.len()
        )));
    }

    for (i, value) in out.iter_mut().enumerate() {
        let mut acc = parts[0][i];
        for part in &parts[1..] {
            let v = part[i];
            acc = match op {
                ReduceOp::Sum | ReduceOp::Mean => acc + v,
                // NaN must win so overflow flags survive the reduction
                ReduceOp::Max => {
                    if acc.is_nan() || v.is_nan() {
                        f32::NAN
                    } else {
                        acc.max(v)
                    }
                }
                ReduceOp::Min => acc.min(v),
            };
        }
        if op == ReduceOp::Mean {
            acc /= parts.len() as f32;
        }
        *value = acc;
    }
    Ok(())
}

/// Collective and point-to-point communication for one rank
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Global rank of the calling process
    fn rank(&self) -> Rank;

    /// Number of ranks in the world
    fn world_size(&self) -> usize;

    /// Gather every member's contribution, returned in group order
    async fn all_gather(&self, group: &ProcessGroup, local: &[f32]) -> Result<Vec<Vec<f32>>>;

    /// Send a tensor to `dst`; `tag` disambiguates concurrent transfers
    async fn send(&self, dst: Rank, tag: u64, data: Vec<f32>) -> Result<()>;

    /// Receive the tensor `src` sent with `tag`
    async fn recv(&self, src: Rank, tag: u64) -> Result<Vec<f32>>;

    /// Reduce `data` in place across the group
    async fn all_reduce(&self, group: &ProcessGroup, data: &mut [f32], op: ReduceOp) -> Result<()> {
        if group.is_trivial() {
            return Ok(());
        }
        let parts = self.all_gather(group, data).await?;
        reduce_parts(data, &parts, op)
    }

    /// Reduce across the group and keep this member's equal-sized chunk
    async fn reduce_scatter(
        &self,
        group: &ProcessGroup,
        data: &[f32],
        op: ReduceOp,
    ) -> Result<Vec<f32>> {
        let index = group.index_of(self.rank()).ok_or_else(|| {
            ShardplanError::communication(format!(
                "rank {} is not a member of group {}",
                self.rank(),
                group
            ))
        })?;
        if data.len() % group.size() != 0 {
            return Err(ShardplanError::communication(format!(
                "reduce-scatter of {} elements is not divisible by group size {}",
                data.len(),
                group.size()
            )));
        }
        let mut reduced = data.to_vec();
        self.all_reduce(group, &mut reduced, op).await?;
        let chunk = data.len() / group.size();
        Ok(reduced[index * chunk..(index + 1) * chunk].to_vec())
    }

    /// Replace `data` on every member with the root's copy
    async fn broadcast(&self, group: &ProcessGroup, data: &mut Vec<f32>, root: Rank) -> Result<()> {
        let root_index = group.index_of(root).ok_or_else(|| {
            ShardplanError::communication(format!("broadcast root {} not in group {}", root, group))
        })?;
        if group.is_trivial() {
            return Ok(());
        }
        let payload = if self.rank() == root {
            data.clone()
        } else {
            Vec::new()
        };
        let mut parts = self.all_gather(group, &payload).await?;
        *data = parts.swap_remove(root_index);
        Ok(())
    }

    /// Block until every member arrives
    async fn barrier(&self, group: &ProcessGroup) -> Result<()> {
        if group.is_trivial() {
            return Ok(());
        }
        self.all_gather(group, &[]).await.map(|_| ())
    }
}
