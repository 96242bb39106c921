//! Pipeline parallelism: stage layer distribution and micro-batch scheduling

pub mod schedule;
pub mod stages;

pub use schedule::{one_f_one_b, PipelineOp};
pub use stages::{LayerDistribution, LayerRange};
