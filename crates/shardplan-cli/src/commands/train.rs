//! Train command implementation

use super::RunOverrides;
use crate::output::{print_header, print_json, OutputFormat};
use clap::Args;
use colored::*;
use shardplan_engine::{run_training, RankSummary};
use shardplan_types::{Result, TrainingConfig};
use std::time::Instant;

#[derive(Args, Debug)]
pub struct TrainCommand {
    /// Optimizer steps to run
    #[arg(short, long)]
    pub steps: Option<usize>,

    #[command(flatten)]
    pub overrides: RunOverrides,
}

pub async fn execute(cmd: TrainCommand, mut config: TrainingConfig, format: OutputFormat) -> Result<()> {
    cmd.overrides.apply(&mut config)?;
    if let Some(steps) = cmd.steps {
        config.max_steps = steps;
    }

    let start = Instant::now();
    let summaries = run_training(&config).await?;

    match format {
        OutputFormat::Json => print_json(&summaries),
        OutputFormat::Table => {
            print_header(&format!(
                "Simulated {} ranks (dp={} pp={} mp={}) for {} steps in {:.2?}",
                config.world_size(),
                config.parallel.dp,
                config.parallel.pp,
                config.parallel.mp,
                config.max_steps,
                start.elapsed()
            ));
            for summary in &summaries {
                print_summary(summary);
            }
            Ok(())
        }
    }
}

fn print_summary(summary: &RankSummary) {
    let losses = if summary.losses.is_empty() {
        "-".dimmed().to_string()
    } else {
        summary
            .losses
            .iter()
            .map(|l| format!("{:.5}", l))
            .collect::<Vec<_>>()
            .join(" ")
    };
    let skipped = if summary.metrics.skipped_steps > 0 {
        summary.metrics.skipped_steps.to_string().red()
    } else {
        "0".normal()
    };
    println!(
        "  rank {:<3} stage {:<2} steps {:<3} skipped {:<3} scale {:<8} loss {}",
        summary.rank,
        summary.stage,
        summary.metrics.optimizer_steps,
        skipped,
        summary.loss_scale,
        losses
    );
}
