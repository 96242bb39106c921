//! Core interface definitions for shardplan
//!
//! This crate defines the trait seams the planner and the sharded execution
//! coordinator talk through. The training-side collaborators (communication
//! backend, optimizer math, learning-rate schedule, data pipeline) are
//! consumed through these traits so that the coordinator never depends on a
//! concrete implementation.

pub mod collective;
pub mod data;
pub mod optimizer;

// Re-export core traits and important types
pub use collective::{Communicator, ProcessGroup, ReduceOp};
pub use data::{Batch, BatchSource};
pub use optimizer::{LrScheduler, Optimizer};

pub use shardplan_types::{Placement, Rank, Result, ShardplanError};
