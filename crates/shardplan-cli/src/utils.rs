//! CLI utility functions

use shardplan_types::{Result, ShardplanError, TrainingConfig};
use std::io;
use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup logging based on verbosity level
pub fn setup_logging(verbose: bool, quiet: bool, json: bool) -> Result<()> {
    let log_level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    let filter = if verbose || quiet {
        EnvFilter::new(log_level.to_string())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{},shardplan_engine::session=info", log_level))
        })
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(io::stderr)))
        .try_init()
        .map_err(|e| ShardplanError::config(format!("Failed to install subscriber: {}", e)))
}

/// Run configuration: the TOML file when given, otherwise the environment
pub fn load_config(path: Option<&Path>) -> Result<TrainingConfig> {
    match path {
        Some(path) => {
            if !path.exists() {
                return Err(ShardplanError::not_found(format!(
                    "config file {}",
                    path.display()
                )));
            }
            TrainingConfig::from_file(path)
        }
        None => TrainingConfig::from_env(),
    }
}
