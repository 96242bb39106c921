//! Serializable summary of a rank's plan

use crate::parallel::{LayerPlan, PipelineSplitPoint, PlannedModel, SharedWeight};
use serde::{Deserialize, Serialize};
use shardplan_types::{format_placements, DataType, Placement, Rank, Result};
use std::collections::BTreeMap;

/// Placement and storage of one parameter on this rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub path: String,
    pub placements: Vec<Placement>,
    pub trainable: bool,
    pub stage: usize,
    pub global_shape: Vec<usize>,
    pub local_shape: Vec<usize>,
    pub dtype: DataType,
    /// Storage lives on this rank
    pub is_local: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tied_to: Option<String>,
}

/// What the planner decided for one rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementReport {
    pub rank: Rank,
    pub stage: usize,
    pub num_stages: usize,
    /// Axes the placement vectors refer to, with their sizes
    pub axes: Vec<(String, usize)>,
    pub tensors: Vec<TensorEntry>,
    pub layers: BTreeMap<String, LayerPlan>,
    pub split_points: Vec<PipelineSplitPoint>,
    pub shared_weights: Vec<SharedWeight>,
    pub unresolved: Vec<String>,
}

impl PlacementReport {
    pub fn from_planned(planned: &PlannedModel, rank: Rank) -> Self {
        let tensors = planned
            .root
            .named_parameters()
            .into_iter()
            .map(|(path, param)| TensorEntry {
                path,
                placements: param.placements().to_vec(),
                trainable: param.trainable,
                stage: param.stage(),
                global_shape: param.global_shape().to_vec(),
                local_shape: param.local_shape().to_vec(),
                dtype: param.dtype(),
                is_local: param.is_materialized(),
                tied_to: param.tied_to().map(str::to_string),
            })
            .collect();

        Self {
            rank,
            stage: planned.stage,
            num_stages: planned.num_stages,
            axes: planned.param_axes.clone(),
            tensors,
            layers: planned.layers.clone(),
            split_points: planned.split_points.clone(),
            shared_weights: planned.shared_weights.clone(),
            unresolved: planned.unresolved.clone(),
        }
    }

    pub fn tensor(&self, path: &str) -> Option<&TensorEntry> {
        self.tensors.iter().find(|t| t.path == path)
    }

    /// Entries whose storage is on this rank
    pub fn local_tensors(&self) -> impl Iterator<Item = &TensorEntry> {
        self.tensors.iter().filter(|t| t.is_local)
    }

    /// Number of parameter elements stored on this rank
    pub fn local_numel(&self) -> usize {
        self.local_tensors()
            .map(|t| t.local_shape.iter().product::<usize>())
            .sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// One line per tensor: path, placements, local shape
    pub fn to_lines(&self) -> Vec<String> {
        self.tensors
            .iter()
            .map(|t| {
                format!(
                    "{} {} {:?} stage={}{}",
                    t.path,
                    format_placements(&t.placements),
                    t.local_shape,
                    t.stage,
                    if t.trainable { "" } else { " frozen" }
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MeshContext;
    use crate::model::llama::{build_llama, parallelize_config, ModelOptions};
    use crate::parallel::Planner;
    use shardplan_types::{LlamaConfig, ParallelConfig, TrainingConfig};

    fn report(rank: Rank) -> PlacementReport {
        let config = TrainingConfig {
            parallel: ParallelConfig {
                mp: 2,
                ..Default::default()
            },
            model: LlamaConfig::tiny(),
            ..Default::default()
        };
        let context = MeshContext::from_parallel_config(rank, &config.parallel).unwrap();
        let model = build_llama(&config.model, ModelOptions::from_training(&config));
        let planned = Planner::new(&context)
            .apply(model, &parallelize_config(&config), config.seed)
            .unwrap();
        PlacementReport::from_planned(&planned, rank)
    }

    #[test]
    fn test_report_lists_local_shards() {
        let report = report(1);
        let q = report.tensor("llama.layers.0.self_attn.q_proj.weight").unwrap();
        assert_eq!(q.global_shape, vec![16, 16]);
        assert_eq!(q.local_shape, vec![16, 8]);
        assert!(q.is_local);
        assert_eq!(report.axes.len(), 2);
        assert!(report.local_numel() > 0);
    }

    #[test]
    fn test_report_serializes() {
        let report = report(0);
        let json = report.to_json().unwrap();
        let parsed: PlacementReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
        assert_eq!(report.to_lines().len(), report.tensors.len());
    }
}
