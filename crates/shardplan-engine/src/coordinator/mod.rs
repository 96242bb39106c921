//! Sharded training execution

pub mod amp;
pub mod compute;
pub mod metrics;
pub mod scaler;
pub mod sharded;

pub use compute::{StageCompute, StageGrads, StageInput, StageParam, SyntheticCompute};
pub use metrics::{CoordinatorMetrics, MetricsSnapshot};
pub use scaler::{GradScaler, ScalerState, StepDecision};
pub use sharded::{CoordinatorParts, CoordinatorSettings, ShardedCoordinator, StepOutcome};
