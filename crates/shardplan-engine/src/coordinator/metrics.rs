//! Coordinator counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Step counters, shareable across tasks
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    micro_steps: AtomicU64,
    optimizer_steps: AtomicU64,
    skipped_steps: AtomicU64,
}

/// Point-in-time copy of [`CoordinatorMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub micro_steps: u64,
    /// Windows that reached the optimizer, applied or skipped
    pub optimizer_steps: u64,
    pub skipped_steps: u64,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_micro_step(&self) {
        self.micro_steps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_optimizer_step(&self, skipped: bool) {
        self.optimizer_steps.fetch_add(1, Ordering::Relaxed);
        if skipped {
            self.skipped_steps.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            micro_steps: self.micro_steps.load(Ordering::Relaxed),
            optimizer_steps: self.optimizer_steps.load(Ordering::Relaxed),
            skipped_steps: self.skipped_steps.load(Ordering::Relaxed),
        }
    }
}
