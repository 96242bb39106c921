//! Shared helpers for engine integration tests

#![allow(dead_code)]

use shardplan_engine::{LocalHub, PlannedModel};
use shardplan_interfaces::Communicator;
use shardplan_types::{LlamaConfig, ParallelConfig, Rank, TrainingConfig};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a test-writer subscriber once per test binary
pub fn init_test_env() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Tiny reference model on the given degrees
pub fn tiny_config(dp: usize, pp: usize, mp: usize) -> TrainingConfig {
    TrainingConfig {
        parallel: ParallelConfig {
            dp,
            pp,
            mp,
            ..Default::default()
        },
        model: LlamaConfig::tiny(),
        ..Default::default()
    }
}

/// Run `f` once per rank of a `world_size` world, each on its own task
pub async fn run_world<F, Fut, T>(world_size: usize, f: F) -> Vec<T>
where
    F: Fn(Rank, Arc<dyn Communicator>) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let hub = LocalHub::new(world_size);
    let handles: Vec<_> = (0..world_size)
        .map(|rank| {
            let comm: Arc<dyn Communicator> =
                Arc::new(hub.communicator(rank).expect("rank inside world"));
            tokio::spawn(f(rank, comm))
        })
        .collect();

    let mut results = Vec::with_capacity(world_size);
    for handle in handles {
        results.push(handle.await.expect("rank task panicked"));
    }
    results
}

/// Local parameter values by path
pub fn local_values(planned: &PlannedModel) -> BTreeMap<String, Vec<f32>> {
    planned
        .root
        .named_parameters()
        .into_iter()
        .filter_map(|(path, param)| param.data().map(|d| (path, d.to_vec())))
        .collect()
}
