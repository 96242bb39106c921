//! Per-axis tensor placement annotations

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a tensor is laid out along one mesh axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    /// Full copy on every rank of the axis
    Replicate,
    /// Partitioned along the given tensor dimension
    Shard(usize),
    /// Pending sum across the axis. Only produced for activations leaving a
    /// row-wise split, never assigned to parameters.
    Partial,
}

impl Placement {
    /// Check if this placement partitions a dimension
    pub fn is_shard(&self) -> bool {
        matches!(self, Placement::Shard(_))
    }

    /// Check if this placement is a full replica
    pub fn is_replicate(&self) -> bool {
        matches!(self, Placement::Replicate)
    }

    /// Check if this placement holds unreduced partial values
    pub fn is_partial(&self) -> bool {
        matches!(self, Placement::Partial)
    }

    /// Sharded tensor dimension, if any
    pub fn shard_dim(&self) -> Option<usize> {
        match self {
            Placement::Shard(dim) => Some(*dim),
            _ => None,
        }
    }
}

impl Default for Placement {
    fn default() -> Self {
        Placement::Replicate
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Replicate => write!(f, "Replicate()"),
            Placement::Shard(dim) => write!(f, "Shard(dim={})", dim),
            Placement::Partial => write!(f, "Partial()"),
        }
    }
}

/// Render a placement list the way the report prints it: `[Replicate(), Shard(dim=1)]`
pub fn format_placements(placements: &[Placement]) -> String {
    let parts: Vec<String> = placements.iter().map(|p| p.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

/// Element type used for parameter compute under mixed precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 32-bit floating point
    FP32,
    /// 16-bit floating point (IEEE 754)
    FP16,
    /// 16-bit brain floating point
    BF16,
}

impl DataType {
    /// Get size in bytes for this data type
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::FP32 => 4,
            DataType::FP16 | DataType::BF16 => 2,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::FP32 => write!(f, "float32"),
            DataType::FP16 => write!(f, "float16"),
            DataType::BF16 => write!(f, "bfloat16"),
        }
    }
}
