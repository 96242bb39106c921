//! Per-rank mesh context
//!
//! Every planner and coordinator call receives a [`MeshContext`] explicitly.
//! The process mesh inside it can be set exactly once; later attempts fail
//! with `AlreadyInitialized` and the mesh stays read-only for the lifetime of
//! the context.

use crate::mesh::DeviceMesh;
use once_cell::sync::OnceCell;
use shardplan_interfaces::ProcessGroup;
use shardplan_types::{ParallelConfig, Rank, Result, ShardplanError};
use std::sync::Arc;
use tracing::debug;

/// Name of the pipeline axis in the global mesh
pub const PP_AXIS: &str = "pp";
/// Name of the tensor-parallel axis in the global mesh
pub const MP_AXIS: &str = "mp";
/// Name of the data-parallel axis in the global mesh
pub const DP_AXIS: &str = "dp";

/// Explicit replacement for a process-wide mesh global
#[derive(Debug)]
pub struct MeshContext {
    rank: Rank,
    device_count: usize,
    mesh: OnceCell<Arc<DeviceMesh>>,
}

impl MeshContext {
    /// Context for `rank` in a world of `device_count` ranks, mesh unset
    pub fn new(rank: Rank, device_count: usize) -> Self {
        Self {
            rank,
            device_count,
            mesh: OnceCell::new(),
        }
    }

    /// Context with the standard `[dp, pp, mp]` mesh already set
    pub fn from_parallel_config(rank: Rank, config: &ParallelConfig) -> Result<Self> {
        let context = Self::new(rank, config.world_size());
        context.set_mesh(DeviceMesh::from_parallel_config(config)?)?;
        Ok(context)
    }

    /// Install the process mesh. Fails with `AlreadyInitialized` on a second call.
    pub fn set_mesh(&self, mesh: DeviceMesh) -> Result<()> {
        if mesh.size() != self.device_count {
            return Err(ShardplanError::invalid_topology(format!(
                "mesh covers {} ranks but the world has {}",
                mesh.size(),
                self.device_count
            )));
        }
        if !mesh.contains_rank(self.rank) {
            return Err(ShardplanError::invalid_topology(format!(
                "rank {} is not part of mesh {}",
                self.rank, mesh
            )));
        }
        debug!(rank = self.rank, mesh = %mesh, "Setting process mesh");
        self.mesh
            .set(Arc::new(mesh))
            .map_err(|_| ShardplanError::AlreadyInitialized)
    }

    /// The process mesh
    pub fn mesh(&self) -> Result<&Arc<DeviceMesh>> {
        self.mesh
            .get()
            .ok_or_else(|| ShardplanError::config("process mesh has not been set"))
    }

    pub fn is_initialized(&self) -> bool {
        self.mesh.get().is_some()
    }

    /// Global rank of this process
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.device_count
    }

    /// Number of pipeline stages (1 without a `pp` axis)
    pub fn num_stages(&self) -> Result<usize> {
        Ok(self.mesh()?.degree(PP_AXIS))
    }

    pub fn is_pipeline_enabled(&self) -> Result<bool> {
        Ok(self.num_stages()? > 1)
    }

    /// Pipeline stage holding `rank`
    pub fn stage_of_rank(&self, rank: Rank) -> Result<usize> {
        let mesh = self.mesh()?;
        if !mesh.contains_axis(PP_AXIS) {
            return Ok(0);
        }
        mesh.axis_coordinate(PP_AXIS, rank)
    }

    /// Pipeline stage of this process
    pub fn stage(&self) -> Result<usize> {
        self.stage_of_rank(self.rank)
    }

    /// Sub-mesh of one pipeline stage; the whole mesh without a `pp` axis
    pub fn stage_mesh(&self, stage: usize) -> Result<DeviceMesh> {
        let mesh = self.mesh()?;
        if mesh.contains_axis(PP_AXIS) {
            mesh.sub_mesh(PP_AXIS, stage)
        } else if stage == 0 {
            Ok(mesh.as_ref().clone())
        } else {
            Err(ShardplanError::invalid_topology(format!(
                "stage {} requested on a mesh without a pipeline axis",
                stage
            )))
        }
    }

    /// Coordinate of this process along `axis`, 0 if the axis is absent
    pub fn coordinate(&self, axis: &str) -> Result<usize> {
        let mesh = self.mesh()?;
        if mesh.contains_axis(axis) {
            mesh.axis_coordinate(axis, self.rank)
        } else {
            Ok(0)
        }
    }

    /// Degree of `axis`, 1 if absent
    pub fn degree(&self, axis: &str) -> Result<usize> {
        Ok(self.mesh()?.degree(axis))
    }

    /// Process group of ranks that differ from this one only along `axis`.
    /// A missing axis yields the trivial group of this rank.
    pub fn group(&self, axis: &str) -> Result<ProcessGroup> {
        let mesh = self.mesh()?;
        if mesh.contains_axis(axis) {
            Ok(ProcessGroup::new(mesh.group_along(axis, self.rank)?))
        } else {
            Ok(ProcessGroup::new(vec![self.rank]))
        }
    }

    /// Rank at the same dp/mp coordinate on another pipeline stage
    pub fn peer_on_stage(&self, stage: usize) -> Result<Rank> {
        let group = self.group(PP_AXIS)?;
        group.ranks().get(stage).copied().ok_or_else(|| {
            ShardplanError::invalid_topology(format!(
                "no pipeline stage {} for rank {}",
                stage, self.rank
            ))
        })
    }

    /// Every rank in the world
    pub fn world_group(&self) -> ProcessGroup {
        ProcessGroup::world(self.device_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parallel(dp: usize, pp: usize, mp: usize) -> ParallelConfig {
        ParallelConfig {
            dp,
            pp,
            mp,
            ..Default::default()
        }
    }

    #[test]
    fn test_set_mesh_twice_fails() {
        let context = MeshContext::new(0, 4);
        context
            .set_mesh(DeviceMesh::new([("dp", 4)], 4).unwrap())
            .unwrap();
        let err = context
            .set_mesh(DeviceMesh::new([("dp", 2), ("mp", 2)], 4).unwrap())
            .unwrap_err();
        assert_eq!(err, ShardplanError::AlreadyInitialized);
        assert_eq!(context.mesh().unwrap().axis_names(), vec!["dp"]);
    }

    #[test]
    fn test_uninitialized_mesh() {
        let context = MeshContext::new(0, 1);
        assert!(!context.is_initialized());
        assert!(context.mesh().is_err());
    }

    #[test]
    fn test_stage_queries() {
        let context = MeshContext::from_parallel_config(6, &parallel(2, 2, 2)).unwrap();
        assert_eq!(context.num_stages().unwrap(), 2);
        assert_eq!(context.stage().unwrap(), 1);
        assert_eq!(context.coordinate(DP_AXIS).unwrap(), 1);
        assert_eq!(context.coordinate(MP_AXIS).unwrap(), 0);
        assert_eq!(context.peer_on_stage(0).unwrap(), 4);
        assert_eq!(context.stage_mesh(1).unwrap().ranks(), &[2, 3, 6, 7]);
        assert_eq!(context.group(MP_AXIS).unwrap().ranks(), &[6, 7]);
    }

    #[test]
    fn test_data_parallel_only_mesh() {
        let context = MeshContext::from_parallel_config(1, &parallel(2, 1, 1)).unwrap();
        assert!(!context.is_pipeline_enabled().unwrap());
        assert_eq!(context.stage().unwrap(), 0);
        assert_eq!(context.group(MP_AXIS).unwrap().ranks(), &[1]);
        assert!(context.stage_mesh(1).is_err());
    }
}
