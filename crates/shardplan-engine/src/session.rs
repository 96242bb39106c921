//! Wiring a training run together: one coordinator per rank, and a driver
//! that runs every rank of the world as a tokio task over the local hub.

use crate::collective::LocalHub;
use crate::context::MeshContext;
use crate::coordinator::amp;
use crate::coordinator::{
    CoordinatorParts, CoordinatorSettings, GradScaler, MetricsSnapshot, ShardedCoordinator,
    StageCompute, SyntheticCompute,
};
use crate::data::{DataLoader, RandomDataset};
use crate::model::{build_llama, inject_lora, parallelize_config, ModelOptions};
use crate::optim::{create_optimizer, LinearWarmup};
use crate::parallel::{PlannedModel, Planner};
use serde::{Deserialize, Serialize};
use shardplan_interfaces::{Batch, BatchSource, Communicator};
use shardplan_types::{Rank, Result, ShardplanError, TrainingConfig};
use std::sync::Arc;
use tracing::{debug, info};

/// Per-rank result of [`run_training`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankSummary {
    pub rank: Rank,
    pub stage: usize,
    /// Mean loss of every closed window, on the last pipeline stage only
    pub losses: Vec<f32>,
    pub metrics: MetricsSnapshot,
    pub loss_scale: f32,
}

/// Build the reference model for a run and plan it for `rank`
pub fn plan_rank(config: &TrainingConfig, rank: Rank) -> Result<(MeshContext, PlannedModel)> {
    config.validate()?;
    let context = MeshContext::from_parallel_config(rank, &config.parallel)?;

    let mut model = build_llama(&config.model, ModelOptions::from_training(config));
    if config.enable_lora {
        model = inject_lora(model, &config.lora, config.seed, config.use_lazy_init)?;
    }
    let mut planned = Planner::new(&context).apply(model, &parallelize_config(config), config.seed)?;
    amp::decorate(&mut planned.root, &config.amp)?;
    Ok((context, planned))
}

/// Coordinator for `rank`, computing with [`SyntheticCompute`]
pub fn build_rank(config: &TrainingConfig, rank: Rank, comm: Arc<dyn Communicator>) -> Result<ShardedCoordinator> {
    let compute = Box::new(SyntheticCompute::new(config.model.vocab_size));
    build_rank_with(config, rank, comm, compute)
}

/// Coordinator for `rank` with a caller-provided stage computation
pub fn build_rank_with(
    config: &TrainingConfig,
    rank: Rank,
    comm: Arc<dyn Communicator>,
    compute: Box<dyn StageCompute>,
) -> Result<ShardedCoordinator> {
    let (context, planned) = plan_rank(config, rank)?;
    let parts = CoordinatorParts {
        compute,
        optimizer: create_optimizer(&config.optimizer),
        scheduler: Box::new(LinearWarmup::from_config(&config.optimizer)),
        scaler: GradScaler::new(&config.amp),
    };
    debug!(rank, stage = planned.stage, "Built rank");
    ShardedCoordinator::new(context, comm, planned, parts, CoordinatorSettings::from_training(config))
}

/// Global micro-batches of a run: every rank draws the same sequence and
/// keeps its data-parallel rows
pub fn training_batches(config: &TrainingConfig) -> Result<Vec<Batch>> {
    let global_batch = config.optimizer.batch_size * config.parallel.dp;
    let count = config.max_steps * config.acc_step.max(1);
    let dataset = RandomDataset::new(
        count * global_batch,
        config.model.seq_length,
        config.model.vocab_size,
        config.seed,
    );
    let mut loader = DataLoader::new(dataset, global_batch)?.drop_last(true);
    let mut batches = Vec::with_capacity(count);
    while let Some(batch) = loader.next_batch() {
        batches.push(batch);
    }
    Ok(batches)
}

/// Run `max_steps` optimizer steps on every rank of the world
pub async fn run_training(config: &TrainingConfig) -> Result<Vec<RankSummary>> {
    config.validate()?;
    let world_size = config.world_size();
    let hub = LocalHub::new(world_size);
    let batches = Arc::new(training_batches(config)?);
    info!(
        world_size,
        steps = config.max_steps,
        acc_step = config.acc_step,
        "Starting simulated run"
    );

    let mut handles = Vec::with_capacity(world_size);
    for rank in 0..world_size {
        let comm: Arc<dyn Communicator> = Arc::new(hub.communicator(rank)?);
        let config = config.clone();
        let batches = Arc::clone(&batches);
        handles.push(tokio::spawn(async move {
            let mut coordinator = build_rank(&config, rank, comm)?;
            let mut losses = Vec::new();
            for batch in batches.iter() {
                let outcome = coordinator.step(batch).await?;
                if let Some(loss) = outcome.window_loss {
                    losses.push(loss);
                }
            }
            Ok::<_, ShardplanError>(RankSummary {
                rank,
                stage: coordinator.model().stage,
                losses,
                metrics: coordinator.metrics_snapshot(),
                loss_scale: coordinator.scaler().loss_scale(),
            })
        }));
    }

    let mut summaries = Vec::with_capacity(world_size);
    for handle in handles {
        let summary = handle
            .await
            .map_err(|e| ShardplanError::execution(format!("rank task failed: {}", e)))??;
        summaries.push(summary);
    }
    info!(ranks = summaries.len(), "Simulated run finished");
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardplan_types::{LlamaConfig, ParallelConfig};

    fn config(dp: usize, mp: usize) -> TrainingConfig {
        TrainingConfig {
            parallel: ParallelConfig {
                dp,
                mp,
                ..Default::default()
            },
            model: LlamaConfig::tiny(),
            acc_step: 2,
            max_steps: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_training_batches_cover_every_step() {
        let batches = training_batches(&config(2, 1)).unwrap();
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.batch_size == 4 && b.seq_len == 8));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_training_reports_every_rank() {
        let summaries = run_training(&config(2, 2)).await.unwrap();
        assert_eq!(summaries.len(), 4);
        for summary in &summaries {
            assert_eq!(summary.metrics.micro_steps, 4);
            assert_eq!(summary.metrics.optimizer_steps, 2);
            assert_eq!(summary.losses.len(), 2);
        }
        assert_eq!(summaries[0].losses, summaries[1].losses);
    }
}
