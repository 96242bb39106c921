//! Parallelization plans and the planner that applies them

pub mod pattern;
pub mod plan;
pub mod planner;
pub mod resolver;

pub use pattern::{CompiledPlan, PathPattern};
pub use plan::{
    DataParallelConfig, ParallelizeConfig, ParallelizePlan, PipelineConfig, PlanEntry, PlanRule,
    SplitPoint, SplitSpec,
};
pub use planner::{
    Collective, LayerPlan, PipelineSplitPoint, PlannedModel, Planner, SharedWeight,
};
pub use resolver::{ParamRole, PlacementResolver, SplitDecision};
