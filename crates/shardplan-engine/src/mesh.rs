//! Device Mesh
//!
//! An N-dimensional logical grid of device ranks with named axes. Ranks are
//! stored densely in row-major order over the axis sizes, so the rank at
//! coordinate `c` lives at flat index `sum(c[i] * stride[i])`.
//!
//! A mesh is immutable once built. Sub-meshes are derived on demand by
//! slicing one axis at a fixed index; they keep the global rank values of the
//! slice, which is how pipeline stages get their own mesh.

use serde::{Deserialize, Serialize};
use shardplan_types::{ParallelConfig, Rank, Result, ShardplanError};
use std::collections::HashMap;
use std::fmt;

/// One named axis of a device mesh
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshAxis {
    name: String,
    size: usize,
}

impl MeshAxis {
    /// Create an axis, rejecting empty names and zero sizes
    pub fn new<N: Into<String>>(name: N, size: usize) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ShardplanError::invalid_topology("mesh axis name is empty"));
        }
        if size == 0 {
            return Err(ShardplanError::invalid_topology(format!(
                "mesh axis '{}' has non-positive size",
                name
            )));
        }
        Ok(Self { name, size })
    }

    /// Axis name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of ranks along the axis
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Logical device grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMesh {
    axes: Vec<MeshAxis>,
    axis_index_by_name: HashMap<String, usize>,
    ranks: Vec<Rank>,
}

impl DeviceMesh {
    /// Build a mesh over ranks `0..device_count` laid out row-major.
    ///
    /// Fails with `InvalidTopology` if any size is zero, an axis name repeats,
    /// or the product of sizes differs from `device_count`.
    pub fn new<N, I>(axes: I, device_count: usize) -> Result<Self>
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, usize)>,
    {
        let axes = axes
            .into_iter()
            .map(|(name, size)| MeshAxis::new(name, size))
            .collect::<Result<Vec<_>>>()?;
        let total = checked_product(&axes)?;
        if total != device_count {
            return Err(ShardplanError::invalid_topology(format!(
                "mesh shape {:?} covers {} devices but {} are available",
                axes.iter().map(MeshAxis::size).collect::<Vec<_>>(),
                total,
                device_count
            )));
        }
        Self::build(axes, (0..device_count).collect())
    }

    /// Build a mesh with an explicit rank array.
    ///
    /// The ranks must be a permutation of `0..product(sizes)`.
    pub fn with_ranks(axes: Vec<MeshAxis>, ranks: Vec<Rank>) -> Result<Self> {
        let total = checked_product(&axes)?;
        if ranks.len() != total {
            return Err(ShardplanError::invalid_topology(format!(
                "rank array has {} entries, mesh shape needs {}",
                ranks.len(),
                total
            )));
        }
        let mut seen = vec![false; total];
        for &rank in &ranks {
            if rank >= total || std::mem::replace(&mut seen[rank], true) {
                return Err(ShardplanError::invalid_topology(format!(
                    "rank array is not a permutation of 0..{}",
                    total
                )));
            }
        }
        Self::build(axes, ranks)
    }

    /// Global mesh for a run: `[dp, pp, mp]`, or `[dp]` alone without pp/mp
    pub fn from_parallel_config(config: &ParallelConfig) -> Result<Self> {
        Self::new(config.mesh_dims(), config.world_size())
    }

    fn build(axes: Vec<MeshAxis>, ranks: Vec<Rank>) -> Result<Self> {
        let mut axis_index_by_name = HashMap::with_capacity(axes.len());
        for (index, axis) in axes.iter().enumerate() {
            if axis_index_by_name.insert(axis.name.clone(), index).is_some() {
                return Err(ShardplanError::invalid_topology(format!(
                    "duplicate mesh axis '{}'",
                    axis.name
                )));
            }
        }
        Ok(Self {
            axes,
            axis_index_by_name,
            ranks,
        })
    }

    /// Axes in declaration order
    pub fn axes(&self) -> &[MeshAxis] {
        &self.axes
    }

    /// Axis names in declaration order
    pub fn axis_names(&self) -> Vec<&str> {
        self.axes.iter().map(MeshAxis::name).collect()
    }

    /// Axis sizes in declaration order
    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(MeshAxis::size).collect()
    }

    /// `(name, size)` pairs in declaration order
    pub fn dims(&self) -> Vec<(String, usize)> {
        self.axes
            .iter()
            .map(|a| (a.name.clone(), a.size))
            .collect()
    }

    /// Number of axes
    pub fn ndim(&self) -> usize {
        self.axes.len()
    }

    /// Number of ranks in the mesh
    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Dense rank array in row-major order
    pub fn ranks(&self) -> &[Rank] {
        &self.ranks
    }

    pub fn contains_axis(&self, name: &str) -> bool {
        self.axis_index_by_name.contains_key(name)
    }

    pub fn contains_rank(&self, rank: Rank) -> bool {
        self.ranks.contains(&rank)
    }

    /// Position of `name` among the axes
    pub fn axis_index(&self, name: &str) -> Result<usize> {
        self.axis_index_by_name
            .get(name)
            .copied()
            .ok_or_else(|| ShardplanError::unknown_axis(name))
    }

    /// Size of the named axis
    pub fn axis_size(&self, name: &str) -> Result<usize> {
        self.axis_index(name).map(|index| self.axes[index].size)
    }

    /// Size of the named axis, treating an absent axis as degree 1
    pub fn degree(&self, name: &str) -> usize {
        self.axis_size(name).unwrap_or(1)
    }

    /// Mesh coordinate of a global rank
    pub fn coordinate_of(&self, rank: Rank) -> Option<Vec<usize>> {
        let flat = self.ranks.iter().position(|r| *r == rank)?;
        Some(coordinate_for_flat_index(flat, &self.shape()))
    }

    /// Rank stored at a mesh coordinate
    pub fn rank_at(&self, coordinate: &[usize]) -> Option<Rank> {
        if coordinate.len() != self.axes.len() {
            return None;
        }
        let mut flat = 0;
        for (c, axis) in coordinate.iter().zip(&self.axes) {
            if *c >= axis.size {
                return None;
            }
            flat = flat * axis.size + c;
        }
        self.ranks.get(flat).copied()
    }

    /// Coordinate of `rank` along one axis
    pub fn axis_coordinate(&self, name: &str, rank: Rank) -> Result<usize> {
        let axis = self.axis_index(name)?;
        let coordinate = self.coordinate_of(rank).ok_or_else(|| {
            ShardplanError::invalid_topology(format!("rank {} is not in the mesh", rank))
        })?;
        Ok(coordinate[axis])
    }

    /// Slice of the mesh at `index` along `name`, with that axis removed.
    ///
    /// Remaining axes keep their order and the slice keeps the original
    /// global rank values.
    pub fn sub_mesh(&self, name: &str, index: usize) -> Result<DeviceMesh> {
        let axis = self.axis_index(name)?;
        if index >= self.axes[axis].size {
            return Err(ShardplanError::invalid_topology(format!(
                "index {} out of range for axis '{}' of size {}",
                index, name, self.axes[axis].size
            )));
        }

        let shape = self.shape();
        let ranks = self
            .ranks
            .iter()
            .enumerate()
            .filter(|(flat, _)| coordinate_for_flat_index(*flat, &shape)[axis] == index)
            .map(|(_, rank)| *rank)
            .collect();
        let axes = self
            .axes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != axis)
            .map(|(_, a)| a.clone())
            .collect();
        Self::build(axes, ranks)
    }

    /// Ranks sharing every coordinate with `rank` except along `name`,
    /// ordered by their coordinate on that axis
    pub fn group_along(&self, name: &str, rank: Rank) -> Result<Vec<Rank>> {
        let axis = self.axis_index(name)?;
        let mut coordinate = self.coordinate_of(rank).ok_or_else(|| {
            ShardplanError::invalid_topology(format!("rank {} is not in the mesh", rank))
        })?;
        let mut group = Vec::with_capacity(self.axes[axis].size);
        for i in 0..self.axes[axis].size {
            coordinate[axis] = i;
            if let Some(r) = self.rank_at(&coordinate) {
                group.push(r);
            }
        }
        Ok(group)
    }
}

impl fmt::Display for DeviceMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axes = self
            .axes
            .iter()
            .map(|a| format!("\"{}\"={}", a.name, a.size))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "DeviceMesh<[{}], ranks={:?}>", axes, self.ranks)
    }
}

fn checked_product(axes: &[MeshAxis]) -> Result<usize> {
    axes.iter().try_fold(1usize, |count, axis| {
        count.checked_mul(axis.size).ok_or_else(|| {
            ShardplanError::invalid_topology("mesh device count overflows usize")
        })
    })
}

fn coordinate_for_flat_index(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut coordinate = vec![0; shape.len()];
    for (i, size) in shape.iter().enumerate().rev() {
        coordinate[i] = flat % size;
        flat /= size;
    }
    coordinate
}
