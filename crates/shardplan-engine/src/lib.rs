//! # Shardplan Engine
//!
//! Turns a single-device model description plus a declarative parallelization
//! plan into a sharded, multi-rank training run.
//!
//! ## Overview
//!
//! - [`mesh`]: N-dimensional device grid with named axes and sub-mesh slicing
//! - [`context`]: per-rank context carrying the process mesh, set exactly once
//! - [`model`]: named layer tree, reference transformer builder and LoRA injection
//! - [`parallel`]: plan rules, path patterns, placement resolver and planner
//! - [`pipeline`]: stage layer distribution and the 1F1B micro-batch schedule
//! - [`coordinator`]: sharded forward/backward/optimizer loop with loss scaling
//! - [`collective`]: in-process communicator for simulated ranks
//!
//! Control flow: mesh is built once, the planner reads the plan and the model's
//! layer tree, the resolver assigns per-leaf placements and the coordinator
//! drives training steps against the sharded model.

pub mod collective;
pub mod context;
pub mod coordinator;
pub mod data;
pub mod mesh;
pub mod model;
pub mod optim;
pub mod parallel;
pub mod pipeline;
pub mod report;
pub mod session;

pub use collective::{LocalCommunicator, LocalHub};
pub use context::MeshContext;
pub use coordinator::{
    CoordinatorMetrics, GradScaler, ScalerState, ShardedCoordinator, StageCompute, StepDecision,
    StepOutcome, SyntheticCompute,
};
pub use data::{shard_batch, DataLoader, RandomDataset};
pub use mesh::{DeviceMesh, MeshAxis};
pub use model::{Layer, LayerKind, ParamTensor};
pub use optim::{create_optimizer, AdamW, LinearWarmup, Sgd};
pub use parallel::{
    DataParallelConfig, LayerPlan, ParallelizeConfig, ParallelizePlan, PipelineConfig,
    PlacementResolver, PlanRule, PlannedModel, Planner, SplitPoint, SplitSpec,
};
pub use pipeline::{one_f_one_b, LayerDistribution, LayerRange, PipelineOp};

pub use report::{PlacementReport, TensorEntry};
pub use session::{
    build_rank, build_rank_with, plan_rank, run_training, training_batches, RankSummary,
};

pub use shardplan_interfaces::{Communicator, ProcessGroup, ReduceOp};
pub use shardplan_types::{Placement, Rank, Result, ShardplanError, TrainingConfig};
