//! Multi-rank training runs over the in-process communicator

mod common;

use common::{init_test_env, local_values, run_world, tiny_config};
use shardplan_engine::{
    build_rank, build_rank_with, training_batches, ScalerState, StepDecision, SyntheticCompute,
};
use shardplan_types::{AmpConfig, AmpDtype, AmpLevel, Placement, ShardingStage};

const Q_WEIGHT: &str = "llama.layers.0.self_attn.q_proj.weight";

#[tokio::test]
async fn test_optimizer_fires_once_per_accumulation_window() {
    init_test_env();
    let mut config = tiny_config(1, 1, 1);
    config.acc_step = 4;
    config.max_steps = 1;
    config.optimizer.warmup_steps = 0;
    let batches = training_batches(&config).unwrap();
    assert_eq!(batches.len(), 4);

    let comm = std::sync::Arc::new(shardplan_engine::LocalHub::new(1).communicator(0).unwrap());
    let mut coordinator = build_rank(&config, 0, comm).unwrap();
    let initial = local_values(coordinator.model())[Q_WEIGHT].clone();

    for (i, batch) in batches[..3].iter().enumerate() {
        let outcome = coordinator.step(batch).await.unwrap();
        assert_eq!(outcome.decision, None);
        assert!(outcome.loss.is_some());
        assert_eq!(coordinator.pending_micro_steps(), i + 1);
        assert!(coordinator.accumulated_loss() > 0.0);
    }
    assert_eq!(local_values(coordinator.model())[Q_WEIGHT], initial);

    let outcome = coordinator.step(&batches[3]).await.unwrap();
    assert_eq!(outcome.decision, Some(StepDecision::Applied));
    assert!(outcome.window_loss.unwrap() > 0.0);
    assert_eq!(coordinator.accumulated_loss(), 0.0);
    assert_eq!(coordinator.pending_micro_steps(), 0);
    assert_ne!(local_values(coordinator.model())[Q_WEIGHT], initial);

    let metrics = coordinator.metrics_snapshot();
    assert_eq!(metrics.micro_steps, 4);
    assert_eq!(metrics.optimizer_steps, 1);
    assert_eq!(metrics.skipped_steps, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overflow_skips_update_and_backs_off_scale() {
    init_test_env();
    let mut config = tiny_config(2, 1, 1);
    config.max_steps = 2;
    // full learning rate from the first step
    config.optimizer.warmup_steps = 0;
    config.amp = AmpConfig {
        enable: true,
        dtype: AmpDtype::Float16,
        level: AmpLevel::O1,
        ..AmpConfig::default()
    };
    let batches = training_batches(&config).unwrap();

    let results = run_world(2, move |rank, comm| {
        let config = config.clone();
        let batches = batches.clone();
        async move {
            // only rank 0 overflows; the flag is reduced mesh-wide
            let mut compute = SyntheticCompute::new(config.model.vocab_size);
            if rank == 0 {
                compute = compute.with_overflow_at(0);
            }
            let mut coordinator = build_rank_with(&config, rank, comm, Box::new(compute)).unwrap();
            let before = local_values(coordinator.model());

            let skipped = coordinator.step(&batches[0]).await.unwrap();
            let after_skip = local_values(coordinator.model());
            let scale_after_skip = coordinator.scaler().loss_scale();
            let history = coordinator.scaler().history().to_vec();

            let applied = coordinator.step(&batches[1]).await.unwrap();
            let after_apply = local_values(coordinator.model());
            (
                before,
                after_skip,
                after_apply,
                scale_after_skip,
                history,
                skipped.decision,
                applied.decision,
                coordinator.metrics_snapshot(),
            )
        }
    })
    .await;

    for (before, after_skip, after_apply, scale, history, skipped, applied, metrics) in results {
        assert_eq!(skipped, Some(StepDecision::Skipped));
        assert_eq!(before, after_skip);
        assert_ne!(after_skip[Q_WEIGHT], after_apply[Q_WEIGHT]);
        assert_eq!(scale, 512.0);
        assert_eq!(
            &history[history.len() - 4..],
            &[
                ScalerState::Scaled,
                ScalerState::Checked,
                ScalerState::Skipped,
                ScalerState::Scaled
            ]
        );
        assert_eq!(applied, Some(StepDecision::Applied));
        assert_eq!(metrics.skipped_steps, 1);
        assert_eq!(metrics.optimizer_steps, 2);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_data_parallel_replicas_stay_equal_under_every_sharding_stage() {
    init_test_env();
    for stage in [
        ShardingStage::Stage0,
        ShardingStage::Stage1,
        ShardingStage::Stage2,
        ShardingStage::Stage3,
    ] {
        let mut config = tiny_config(2, 1, 2);
        config.parallel.sharding_stage = stage;
        config.acc_step = 2;
        config.max_steps = 2;
        let batches = training_batches(&config).unwrap();

        let results = run_world(4, move |rank, comm| {
            let config = config.clone();
            let batches = batches.clone();
            async move {
                let mut coordinator = build_rank(&config, rank, comm).unwrap();
                let initial = local_values(coordinator.model());
                for batch in &batches {
                    coordinator.step(batch).await.unwrap();
                }
                let dp_sharded: Vec<String> = coordinator
                    .model()
                    .root
                    .named_parameters()
                    .into_iter()
                    .filter(|(_, p)| p.placements().first() == Some(&Placement::Shard(0)))
                    .map(|(path, _)| path)
                    .collect();
                (initial, local_values(coordinator.model()), dp_sharded)
            }
        })
        .await;

        // mesh is [dp, mp]: ranks 0/2 and 1/3 are data-parallel replicas
        for (a, b) in [(0, 2), (1, 3)] {
            let (initial, left, sharded) = &results[a];
            let (_, right, _) = &results[b];
            assert_ne!(&left[Q_WEIGHT], &initial[Q_WEIGHT], "{:?} did not train", stage);
            if stage.shards_parameters() {
                assert!(!sharded.is_empty());
            } else {
                assert!(sharded.is_empty());
            }
            for (path, values) in left {
                if sharded.contains(path) {
                    continue;
                }
                assert_eq!(values, &right[path], "{:?}: '{}' diverged", stage, path);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_embedding_stays_in_sync_across_stages() {
    init_test_env();
    let mut config = tiny_config(1, 2, 1);
    config.share_embedding = true;
    config.max_steps = 3;
    let batches = training_batches(&config).unwrap();

    let results = run_world(2, move |rank, comm| {
        let config = config.clone();
        let batches = batches.clone();
        async move {
            let mut coordinator = build_rank(&config, rank, comm).unwrap();
            let mut losses = Vec::new();
            for batch in &batches {
                losses.push(coordinator.step(batch).await.unwrap().window_loss);
            }
            (local_values(coordinator.model()), losses)
        }
    })
    .await;

    let (first, first_losses) = &results[0];
    let (last, last_losses) = &results[1];
    assert_eq!(first["llama.embed_tokens.weight"], last["lm_head.weight"]);
    assert!(!first.contains_key("lm_head.weight"));
    assert!(first_losses.iter().all(Option::is_none));
    assert!(last_losses.iter().all(Option::is_some));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_window_runs_one_f_one_b() {
    init_test_env();
    let mut config = tiny_config(1, 2, 1);
    config.acc_step = 4;
    config.max_steps = 1;
    let batches = training_batches(&config).unwrap();

    let results = run_world(2, move |rank, comm| {
        let config = config.clone();
        let batches = batches.clone();
        async move {
            let mut coordinator = build_rank(&config, rank, comm).unwrap();
            let outcome = coordinator.train_window(&batches).await.unwrap();
            (outcome, coordinator.metrics_snapshot(), coordinator.pending_micro_steps())
        }
    })
    .await;

    let (first, first_metrics, _) = &results[0];
    let (last, _, pending) = &results[1];
    assert_eq!(first.loss, None);
    assert!(last.loss.unwrap() > 0.0);
    assert_eq!(last.window_loss, last.loss);
    assert_eq!(first.decision, Some(StepDecision::Applied));
    assert_eq!(last.decision, Some(StepDecision::Applied));
    assert_eq!(first.micro_step, 3);
    assert_eq!(first_metrics.micro_steps, 4);
    assert_eq!(*pending, 0);
}
