//! # Shardplan CLI Library
//!
//! ## Commands
//!
//! - `plan`: print the resolved placement report for one rank or every rank
//! - `train`: simulate every rank as a tokio task and run training steps

pub mod commands;
pub mod output;
pub mod utils;

pub use output::OutputFormat;
