//! Declarative parallelization plans
//!
//! A plan maps layer or parameter path patterns to an ordered list of
//! [`PlanRule`] steps. Plans are built once from static configuration and
//! never mutated during execution.

use serde::{Deserialize, Serialize};
use shardplan_types::ShardingStage;
use std::fmt;

/// One transformation step applied to the layers a pattern matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanRule {
    /// Split the output dimension; optionally all-gather the output activation
    ColWiseParallel { gather_output: bool },
    /// Split the input dimension; the input arrives already split unless
    /// `is_input_parallel` is false
    RowWiseParallel { is_input_parallel: bool },
    /// Activations after this layer are sharded along the sequence
    SequenceParallelBegin { need_transpose: bool },
    /// Gather the sequence before this layer; sequence parallelism ends here
    SequenceParallelEnd { need_transpose: bool },
    /// Run this subtree with sequence-sharded activations
    SequenceParallelEnable,
    /// Run this subtree on the full sequence
    SequenceParallelDisable { need_transpose: bool },
}

impl PlanRule {
    /// `ColWiseParallel()` with defaults
    pub fn col_wise() -> Self {
        PlanRule::ColWiseParallel {
            gather_output: false,
        }
    }

    /// `RowWiseParallel()` with defaults
    pub fn row_wise() -> Self {
        PlanRule::RowWiseParallel {
            is_input_parallel: true,
        }
    }

    pub fn sequence_parallel_begin() -> Self {
        PlanRule::SequenceParallelBegin {
            need_transpose: true,
        }
    }

    pub fn sequence_parallel_end() -> Self {
        PlanRule::SequenceParallelEnd {
            need_transpose: true,
        }
    }

    pub fn sequence_parallel_disable() -> Self {
        PlanRule::SequenceParallelDisable {
            need_transpose: true,
        }
    }

    /// Rule kind name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            PlanRule::ColWiseParallel { .. } => "ColWiseParallel",
            PlanRule::RowWiseParallel { .. } => "RowWiseParallel",
            PlanRule::SequenceParallelBegin { .. } => "SequenceParallelBegin",
            PlanRule::SequenceParallelEnd { .. } => "SequenceParallelEnd",
            PlanRule::SequenceParallelEnable => "SequenceParallelEnable",
            PlanRule::SequenceParallelDisable { .. } => "SequenceParallelDisable",
        }
    }

    /// Column- or row-wise weight split
    pub fn is_tensor_split(&self) -> bool {
        matches!(
            self,
            PlanRule::ColWiseParallel { .. } | PlanRule::RowWiseParallel { .. }
        )
    }

    /// One of the sequence-parallel markers
    pub fn is_sequence_marker(&self) -> bool {
        !self.is_tensor_split()
    }
}

impl fmt::Display for PlanRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanRule::ColWiseParallel { gather_output } => {
                write!(f, "ColWiseParallel(gather_output={})", gather_output)
            }
            PlanRule::RowWiseParallel { is_input_parallel } => {
                write!(f, "RowWiseParallel(is_input_parallel={})", is_input_parallel)
            }
            PlanRule::SequenceParallelBegin { need_transpose }
            | PlanRule::SequenceParallelEnd { need_transpose }
            | PlanRule::SequenceParallelDisable { need_transpose } => {
                write!(f, "{}(need_transpose={})", self.name(), need_transpose)
            }
            PlanRule::SequenceParallelEnable => write!(f, "SequenceParallelEnable()"),
        }
    }
}

/// Rules declared for one path pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub pattern: String,
    pub rules: Vec<PlanRule>,
}

impl PlanEntry {
    /// Human-readable rule list, e.g. `ColWiseParallel(..), SequenceParallelBegin(..)`
    pub fn describe(&self) -> String {
        self.rules
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Ordered pattern → rules mapping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelizePlan {
    entries: Vec<PlanEntry>,
}

impl ParallelizePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one rule to `pattern`, creating the entry on first use
    pub fn rule(mut self, pattern: impl Into<String>, rule: PlanRule) -> Self {
        self.push(pattern.into(), rule);
        self
    }

    /// Append several rules to `pattern` in order
    pub fn rules(mut self, pattern: impl Into<String>, rules: Vec<PlanRule>) -> Self {
        let pattern = pattern.into();
        for rule in rules {
            self.push(pattern.clone(), rule);
        }
        self
    }

    fn push(&mut self, pattern: String, rule: PlanRule) {
        match self.entries.iter_mut().find(|e| e.pattern == pattern) {
            Some(entry) => entry.rules.push(rule),
            None => self.entries.push(PlanEntry {
                pattern,
                rules: vec![rule],
            }),
        }
    }

    /// Entries in declaration order
    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Prefix every pattern, e.g. with `model.` for an adapter-wrapped model
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|e| PlanEntry {
                    pattern: format!("{}{}", prefix, e.pattern),
                    rules: e.rules.clone(),
                })
                .collect(),
        }
    }
}

/// Boundary marker of an explicit pipeline split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitPoint {
    /// A new stage starts at the named layer
    Beginning,
    /// A new stage starts right after the named layer
    End,
}

/// How layers are divided into pipeline stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SplitSpec {
    /// Split the named layer list evenly; earlier stages take any remainder
    Even(String),
    /// Explicit boundaries, one fewer than the number of stages
    Points(Vec<(String, SplitPoint)>),
}

/// Pipeline-parallel options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub split_spec: SplitSpec,
    /// Layer pinned to the last stage regardless of position
    pub global_spec: Option<String>,
}

/// Data-parallel options
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DataParallelConfig {
    pub sharding_level: ShardingStage,
}

/// Full parallelization request: `dp_config`, `mp_config`, `pp_config`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelizeConfig {
    pub dp_config: Option<DataParallelConfig>,
    pub mp_config: Option<ParallelizePlan>,
    pub pp_config: Option<PipelineConfig>,
}

impl ParallelizeConfig {
    /// Data-parallel sharding level, stage 0 without a dp config
    pub fn sharding_stage(&self) -> ShardingStage {
        self.dp_config
            .map(|c| c.sharding_level)
            .unwrap_or_default()
    }
}
