//! Output formatting utilities

use colored::*;
use serde::Serialize;
use shardplan_types::{Result, ShardplanError};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Print `data` as pretty JSON
pub fn print_json<T: Serialize>(data: &T) -> Result<()> {
    let output = serde_json::to_string_pretty(data)
        .map_err(|e| ShardplanError::serialization(format!("JSON serialization failed: {}", e)))?;
    println!("{}", output);
    Ok(())
}

/// Print a section header
pub fn print_header(title: &str) {
    println!("{}", title.bright_blue().bold());
}

/// Print error with formatting
pub fn print_error(error: &ShardplanError) {
    eprintln!("{} {}", "Error:".red().bold(), error);
}

/// Print warning with formatting
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "Warning:".yellow().bold(), message);
}
