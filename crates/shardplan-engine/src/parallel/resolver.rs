//! Placement Resolver
//!
//! Maps a parameter path to one [`Placement`] per axis of the mesh the
//! parameter lives on (its pipeline stage's sub-mesh).
//!
//! ## Tensor-parallel axis
//!
//! Linear weights are `[in, out]`, so for a layer matched by
//! - `ColWiseParallel`: weight and `lora_B` are `Shard(last)`, bias `Shard(0)`,
//!   `lora_A` stays replicated
//! - `RowWiseParallel`: weight and `lora_A` are `Shard(0)`, bias and `lora_B`
//!   stay replicated
//!
//! A rule addressed to a parameter path directly (`lm_head.weight`) shards
//! that tensor's last dimension for column-wise and dimension 0 for row-wise.
//! With a tensor-parallel degree of 1 every rule is a pass-through.
//!
//! ## Data-parallel axis
//!
//! Replicated, except under sharding stage 3 where parameters are sharded on
//! dimension 0 when that dimension divides evenly.

use super::pattern::CompiledPlan;
use super::plan::{ParallelizePlan, PlanRule};
use crate::context::{DP_AXIS, MP_AXIS};
use crate::mesh::DeviceMesh;
use crate::model::split_param_path;
use shardplan_types::{Placement, Result, ShardingStage, ShardplanError};
use tracing::debug;

/// What a parameter is to its layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    Weight,
    Bias,
    LoraA,
    LoraB,
}

impl ParamRole {
    pub fn from_name(name: &str) -> Self {
        match name {
            "bias" => ParamRole::Bias,
            "lora_A" => ParamRole::LoraA,
            "lora_B" => ParamRole::LoraB,
            _ => ParamRole::Weight,
        }
    }
}

/// A tensor-parallel split chosen for one parameter
#[derive(Debug, Clone, PartialEq)]
pub struct SplitDecision {
    pub rule: PlanRule,
    pub pattern: String,
    pub dim: usize,
}

/// Resolves per-axis placements against a compiled plan
#[derive(Debug, Clone)]
pub struct PlacementResolver {
    axes: Vec<(String, usize)>,
    plan: CompiledPlan,
    sharding_stage: ShardingStage,
}

impl PlacementResolver {
    /// Resolver for parameters living on `param_mesh`
    pub fn new(
        param_mesh: &DeviceMesh,
        plan: Option<&ParallelizePlan>,
        sharding_stage: ShardingStage,
    ) -> Self {
        let empty = ParallelizePlan::new();
        Self {
            axes: param_mesh.dims(),
            plan: CompiledPlan::compile(plan.unwrap_or(&empty)),
            sharding_stage,
        }
    }

    /// Axes placements are reported for
    pub fn axes(&self) -> &[(String, usize)] {
        &self.axes
    }

    pub fn plan(&self) -> &CompiledPlan {
        &self.plan
    }

    fn degree(&self, axis: &str) -> usize {
        self.axes
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, size)| *size)
            .unwrap_or(1)
    }

    /// First column/row rule declared for exactly this path
    pub fn tensor_rule(&self, path: &str) -> Option<(PlanRule, &str)> {
        let entry = self.plan.lookup(path)?;
        entry
            .rules
            .iter()
            .find(|r| r.is_tensor_split())
            .map(|r| (*r, entry.pattern.as_str()))
    }

    /// Column/row rule governing a layer's activations: the layer's own rule,
    /// else a rule on its `weight`
    pub fn activation_rule(&self, layer_path: &str) -> Option<PlanRule> {
        if self.degree(MP_AXIS) <= 1 {
            return None;
        }
        self.tensor_rule(layer_path)
            .or_else(|| self.tensor_rule(&format!("{}.weight", layer_path)))
            .map(|(rule, _)| rule)
    }

    /// Tensor-parallel split of one parameter, `None` when replicated
    pub fn tensor_parallel_split(&self, path: &str, shape: &[usize]) -> Option<SplitDecision> {
        if self.degree(MP_AXIS) <= 1 || shape.is_empty() {
            return None;
        }
        let last = shape.len() - 1;

        if let Some((rule, pattern)) = self.tensor_rule(path) {
            let dim = match rule {
                PlanRule::ColWiseParallel { .. } => last,
                _ => 0,
            };
            return Some(SplitDecision {
                rule,
                pattern: pattern.to_string(),
                dim,
            });
        }

        let (layer, name) = split_param_path(path);
        let (rule, pattern) = self.tensor_rule(layer)?;
        let dim = match (rule, ParamRole::from_name(name)) {
            (PlanRule::ColWiseParallel { .. }, ParamRole::LoraA) => return None,
            (PlanRule::ColWiseParallel { .. }, _) => last,
            (PlanRule::RowWiseParallel { .. }, ParamRole::Weight | ParamRole::LoraA)
                if shape.len() >= 2 =>
            {
                0
            }
            _ => return None,
        };
        Some(SplitDecision {
            rule,
            pattern: pattern.to_string(),
            dim,
        })
    }

    /// Per-axis placements of the parameter at `path` with global `shape`.
    ///
    /// Fails with `ShapeMismatch` when a tensor-parallel shard does not
    /// divide its dimension.
    pub fn resolve(&self, path: &str, shape: &[usize]) -> Result<Vec<Placement>> {
        let mut placements = vec![Placement::Replicate; self.axes.len()];
        let mp = self.degree(MP_AXIS);
        let mut dim0_divisor = 1;

        if let Some(split) = self.tensor_parallel_split(path, shape) {
            if shape[split.dim] % mp != 0 {
                return Err(ShardplanError::ShapeMismatch {
                    path: path.to_string(),
                    rule: format!("{} -> {}", split.pattern, split.rule),
                    dim: split.dim,
                    size: shape[split.dim],
                    divisor: mp,
                });
            }
            if let Some(index) = self.axis_position(MP_AXIS) {
                placements[index] = Placement::Shard(split.dim);
            }
            if split.dim == 0 {
                dim0_divisor = mp;
            }
        }

        let dp = self.degree(DP_AXIS);
        if self.sharding_stage.shards_parameters() && dp > 1 && !shape.is_empty() {
            if shape[0] % (dp * dim0_divisor) == 0 {
                if let Some(index) = self.axis_position(DP_AXIS) {
                    placements[index] = Placement::Shard(0);
                }
            } else {
                debug!(
                    path,
                    size = shape[0],
                    dp,
                    "Dimension 0 not divisible for stage-3 sharding, keeping replica"
                );
            }
        }

        Ok(placements)
    }

    fn axis_position(&self, axis: &str) -> Option<usize> {
        self.axes.iter().position(|(name, _)| name == axis)
    }
}
