//! Shardplan CLI - plan and simulate hybrid-parallel training runs

use clap::{Parser, Subcommand};
use colored::*;
use shardplan_cli::{
    commands::*,
    output::{print_error, OutputFormat},
    utils::{load_config, setup_logging},
};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "shardplan")]
#[command(about = "Shardplan hybrid-parallel planner")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    long_about = "Resolve per-tensor placements for a dp x pp x mp device mesh and simulate sharded training runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (default: read the environment)
    #[arg(short, long, env = "SHARDPLAN_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved placement report
    Plan(PlanCommand),

    /// Run training steps on every simulated rank
    Train(TrainCommand),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet, cli.log_json).unwrap_or_else(|e| {
        eprintln!("{} Failed to setup logging: {}", "Error:".red().bold(), e);
        process::exit(1);
    });

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} Failed to load config: {}", "Error:".red().bold(), e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Plan(cmd) => plan::execute(cmd, config, cli.format).await,
        Commands::Train(cmd) => train::execute(cmd, config, cli.format).await,
    };

    if let Err(e) = result {
        print_error(&e);
        process::exit(1);
    }
}
