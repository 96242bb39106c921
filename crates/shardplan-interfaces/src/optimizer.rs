//! Optimizer and learning-rate schedule interfaces
//!
//! Optimizer math is treated as an opaque service: the coordinator hands it
//! one local parameter shard and its (already synchronised, unscaled)
//! gradient at a time.

use shardplan_types::Result;

/// Parameter update rule
pub trait Optimizer: Send + Sync {
    /// Optimizer name for logs
    fn name(&self) -> &str;

    /// Update one parameter shard in place.
    ///
    /// `key` identifies the shard across calls so stateful optimizers can
    /// keep their moments; `apply_decay` is false for bias and norm weights.
    fn update(
        &mut self,
        key: &str,
        param: &mut [f32],
        grad: &[f32],
        lr: f32,
        apply_decay: bool,
    ) -> Result<()>;

    /// Number of state values held for `key`
    fn state_len(&self, key: &str) -> usize;
}

/// Learning-rate schedule stepped once per optimizer step
pub trait LrScheduler: Send + Sync {
    /// Learning rate for the next optimizer step
    fn get_lr(&self) -> f32;

    /// Advance the schedule
    fn step(&mut self);

    /// Number of completed steps
    fn last_step(&self) -> usize;
}
