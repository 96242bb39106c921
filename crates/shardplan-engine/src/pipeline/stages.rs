//! Layer distribution across pipeline stages

use serde::{Deserialize, Serialize};

/// Range of repeated blocks assigned to a pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRange {
    /// First block (inclusive)
    pub start: usize,
    /// Last block (exclusive)
    pub end: usize,
}

impl LayerRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, layer: usize) -> bool {
        layer >= self.start && layer < self.end
    }
}

/// Block assignment per pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDistribution {
    pub stage_layers: Vec<LayerRange>,
}

impl LayerDistribution {
    /// Even distribution; the first `num_layers % num_stages` stages take one extra block
    pub fn even_distribution(num_layers: usize, num_stages: usize) -> Self {
        let layers_per_stage = num_layers / num_stages;
        let remainder = num_layers % num_stages;

        let mut stage_layers = Vec::with_capacity(num_stages);
        let mut start = 0;

        for stage in 0..num_stages {
            let extra = if stage < remainder { 1 } else { 0 };
            let end = start + layers_per_stage + extra;
            stage_layers.push(LayerRange::new(start, end));
            start = end;
        }

        Self { stage_layers }
    }

    pub fn num_stages(&self) -> usize {
        self.stage_layers.len()
    }

    /// Stage owning a block
    pub fn stage_for_layer(&self, layer: usize) -> Option<usize> {
        self.stage_layers.iter().position(|range| range.contains(layer))
    }

    /// Index of the last block of every stage but the final one
    pub fn boundaries(&self) -> Vec<usize> {
        self.stage_layers
            .iter()
            .take(self.stage_layers.len().saturating_sub(1))
            .map(|range| range.end - 1)
            .collect()
    }

    /// Every stage holds at least one block
    pub fn is_complete(&self) -> bool {
        self.stage_layers.iter().all(|range| !range.is_empty())
    }
}
