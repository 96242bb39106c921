//! Plan command implementation

use super::RunOverrides;
use crate::output::{print_header, print_json, print_warning, OutputFormat};
use clap::Args;
use colored::*;
use shardplan_engine::{plan_rank, PlacementReport};
use shardplan_types::{format_placements, Rank, Result, ShardplanError, TrainingConfig};
use tracing::debug;

#[derive(Args, Debug)]
pub struct PlanCommand {
    /// Rank to plan for (default: every rank)
    #[arg(short, long)]
    pub rank: Option<Rank>,

    /// Also print per-layer activation layouts and collectives
    #[arg(long)]
    pub layers: bool,

    #[command(flatten)]
    pub overrides: RunOverrides,
}

/// Placement reports for the requested ranks
pub fn build_reports(config: &TrainingConfig, rank: Option<Rank>) -> Result<Vec<PlacementReport>> {
    let world_size = config.world_size();
    let ranks: Vec<Rank> = match rank {
        Some(rank) if rank >= world_size => {
            return Err(ShardplanError::config(format!(
                "rank {} is outside a world of {}",
                rank, world_size
            )))
        }
        Some(rank) => vec![rank],
        None => (0..world_size).collect(),
    };

    ranks
        .into_iter()
        .map(|rank| {
            let (_, planned) = plan_rank(config, rank)?;
            debug!(rank, tensors = planned.local_parameters().len(), "Planned rank");
            Ok(PlacementReport::from_planned(&planned, rank))
        })
        .collect()
}

pub async fn execute(cmd: PlanCommand, mut config: TrainingConfig, format: OutputFormat) -> Result<()> {
    cmd.overrides.apply(&mut config)?;
    let reports = build_reports(&config, cmd.rank)?;

    match format {
        OutputFormat::Json => print_json(&reports),
        OutputFormat::Table => {
            for report in &reports {
                print_report(report, cmd.layers);
            }
            Ok(())
        }
    }
}

fn print_report(report: &PlacementReport, layers: bool) {
    let axes: Vec<String> = report
        .axes
        .iter()
        .map(|(name, size)| format!("{}={}", name, size))
        .collect();
    print_header(&format!(
        "Rank {} | stage {}/{} | axes [{}]",
        report.rank,
        report.stage,
        report.num_stages,
        axes.join(", ")
    ));

    for tensor in &report.tensors {
        let shape = if tensor.is_local {
            format!("{:?}", tensor.local_shape).normal()
        } else {
            format!("stage {}", tensor.stage).dimmed()
        };
        let flags = match (tensor.trainable, &tensor.tied_to) {
            (_, Some(source)) => format!("tied to {}", source).yellow(),
            (false, None) => "frozen".dimmed(),
            (true, None) => "".normal(),
        };
        println!(
            "  {:<56} {:<28} {:<12} {}",
            tensor.path,
            format_placements(&tensor.placements).cyan(),
            shape,
            flags
        );
    }

    if layers {
        println!("  {}", "Activations".bold());
        for (path, plan) in &report.layers {
            let collectives: Vec<String> = plan.collectives.iter().map(|c| c.to_string()).collect();
            println!(
                "  {:<48} {} -> {} {}{}",
                path,
                format_placements(&plan.input),
                format_placements(&plan.output),
                collectives.join(" ").green(),
                if plan.sequence_parallel { " [sp]" } else { "" }
            );
        }
    }

    for split in &report.split_points {
        println!(
            "  {} {} ({:?}) starts stage {}",
            "split".bold(),
            split.path,
            split.marker,
            split.next_stage
        );
    }
    for pattern in &report.unresolved {
        print_warning(&format!("plan rule '{}' matched nothing", pattern));
    }
    println!(
        "  {} local elements",
        report.local_numel().to_string().bright_green()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mp: usize) -> TrainingConfig {
        let mut config = TrainingConfig::default();
        RunOverrides {
            mp: Some(mp),
            tiny: true,
            ..Default::default()
        }
        .apply(&mut config)
        .unwrap();
        config
    }

    #[test]
    fn test_reports_for_every_rank() {
        let reports = build_reports(&config(2), None).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].rank, 1);
    }

    #[test]
    fn test_rank_outside_world() {
        assert!(build_reports(&config(2), Some(2)).is_err());
    }
}
