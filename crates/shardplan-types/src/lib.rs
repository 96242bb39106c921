//! Core type definitions for the shardplan parallel planner
//!
//! This crate contains the error taxonomy, placement annotations and
//! configuration types shared by every other shardplan crate. It is kept
//! dependency-light so that interface crates can depend on it freely.

pub mod config;
pub mod errors;
pub mod placement;

// Re-export commonly used types
pub use config::*;
pub use errors::*;
pub use placement::*;

/// Result type used throughout shardplan
pub type Result<T> = std::result::Result<T, ShardplanError>;

/// Global rank of a device in the mesh
pub type Rank = usize;
