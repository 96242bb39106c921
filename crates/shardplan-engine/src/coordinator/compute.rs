//! Per-stage forward/backward seam
//!
//! The coordinator never differentiates anything itself. A [`StageCompute`]
//! runs the layers of one pipeline stage on this rank's parameter shards and
//! returns activations and gradients as flat buffers.

use shardplan_interfaces::Batch;
use shardplan_types::{Result, ShardplanError};
use std::collections::{HashMap, HashSet};

/// One local parameter shard handed to the stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageParam {
    pub path: String,
    pub data: Vec<f32>,
    pub trainable: bool,
}

/// What the stage consumes: tokens on the first stage, activations after
#[derive(Debug)]
pub enum StageInput<'a> {
    Tokens(&'a Batch),
    Activation(Vec<f32>),
}

/// Gradients produced by one backward pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageGrads {
    /// Gradient with respect to the stage input, sent to the previous stage
    pub input_grad: Vec<f32>,
    /// Gradients of trainable parameters, by path
    pub param_grads: Vec<(String, Vec<f32>)>,
}

/// Forward/backward of the layers held by one pipeline stage
pub trait StageCompute: Send + Sync {
    fn forward(&mut self, micro: u64, params: &[StageParam], input: StageInput<'_>) -> Result<Vec<f32>>;

    /// Loss and its gradient with respect to the last stage's output
    fn loss(&mut self, micro: u64, output: &[f32], batch: &Batch) -> Result<(f32, Vec<f32>)>;

    fn backward(&mut self, micro: u64, params: &[StageParam], grad_output: &[f32]) -> Result<StageGrads>;
}

/// Cheap differentiable stand-in for a transformer stage.
///
/// Activations hold one value per batch row. The first stage embeds a row as
/// its mean token id over the vocabulary size; every stage multiplies by
/// `1 + w`, where `w` is the mean of all local parameter values. The loss is
/// the mean squared distance to the label rows embedded the same way.
#[derive(Debug, Clone)]
pub struct SyntheticCompute {
    vocab_size: usize,
    saved: HashMap<u64, (Vec<f32>, f32, usize)>,
    overflow_at: HashSet<u64>,
}

impl SyntheticCompute {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size: vocab_size.max(1),
            saved: HashMap::new(),
            overflow_at: HashSet::new(),
        }
    }

    /// Produce infinite parameter gradients for micro-batch `micro`
    pub fn with_overflow_at(mut self, micro: u64) -> Self {
        self.overflow_at.insert(micro);
        self
    }

    fn embed_rows(&self, ids: &[i64], batch: &Batch) -> Vec<f32> {
        ids.chunks(batch.seq_len.max(1))
            .map(|row| {
                let sum: f64 = row.iter().map(|t| *t as f64).sum();
                (sum / row.len().max(1) as f64 / self.vocab_size as f64) as f32
            })
            .collect()
    }
}

impl StageCompute for SyntheticCompute {
    fn forward(&mut self, micro: u64, params: &[StageParam], input: StageInput<'_>) -> Result<Vec<f32>> {
        let x = match input {
            StageInput::Tokens(batch) => self.embed_rows(&batch.input_ids, batch),
            StageInput::Activation(x) => x,
        };
        let count: usize = params.iter().map(|p| p.data.len()).sum();
        let sum: f64 = params
            .iter()
            .flat_map(|p| p.data.iter())
            .map(|v| *v as f64)
            .sum();
        let w = if count == 0 { 0.0 } else { (sum / count as f64) as f32 };

        let out = x.iter().map(|v| v * (1.0 + w)).collect();
        self.saved.insert(micro, (x, w, count));
        Ok(out)
    }

    fn loss(&mut self, _micro: u64, output: &[f32], batch: &Batch) -> Result<(f32, Vec<f32>)> {
        let target = self.embed_rows(&batch.labels, batch);
        if target.len() != output.len() {
            return Err(ShardplanError::execution(format!(
                "output has {} rows but labels have {}",
                output.len(),
                target.len()
            )));
        }
        let rows = output.len().max(1) as f32;
        let loss = output
            .iter()
            .zip(&target)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            / rows;
        let grad = output
            .iter()
            .zip(&target)
            .map(|(x, y)| 2.0 * (x - y) / rows)
            .collect();
        Ok((loss, grad))
    }

    fn backward(&mut self, micro: u64, params: &[StageParam], grad_output: &[f32]) -> Result<StageGrads> {
        let (x, w, count) = self.saved.remove(&micro).ok_or_else(|| {
            ShardplanError::execution(format!("backward of micro-batch {} before its forward", micro))
        })?;
        if x.len() != grad_output.len() {
            return Err(ShardplanError::execution(format!(
                "gradient has {} rows but the activation has {}",
                grad_output.len(),
                x.len()
            )));
        }

        let input_grad = grad_output.iter().map(|g| g * (1.0 + w)).collect();
        let dw: f32 = grad_output.iter().zip(&x).map(|(g, v)| g * v).sum();
        let per_element = if self.overflow_at.contains(&micro) {
            f32::INFINITY
        } else if count == 0 {
            0.0
        } else {
            dw / count as f32
        };
        let param_grads = params
            .iter()
            .filter(|p| p.trainable)
            .map(|p| (p.path.clone(), vec![per_element; p.data.len()]))
            .collect();

        Ok(StageGrads {
            input_grad,
            param_grads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Batch {
        Batch::new(vec![2, 2, 6, 6], vec![4, 4, 4, 4], 2, 2).unwrap()
    }

    fn params() -> Vec<StageParam> {
        vec![
            StageParam {
                path: "a.weight".to_string(),
                data: vec![0.5, 0.5],
                trainable: true,
            },
            StageParam {
                path: "b.weight".to_string(),
                data: vec![0.5, 0.5],
                trainable: false,
            },
        ]
    }

    #[test]
    fn test_forward_backward_shapes() {
        let mut compute = SyntheticCompute::new(8);
        let batch = batch();
        let out = compute.forward(0, &params(), StageInput::Tokens(&batch)).unwrap();
        assert_eq!(out, vec![0.25 * 1.5, 0.75 * 1.5]);

        let (loss, grad) = compute.loss(0, &out, &batch).unwrap();
        assert!(loss > 0.0);
        let grads = compute.backward(0, &params(), &grad).unwrap();
        assert_eq!(grads.input_grad.len(), 2);
        assert_eq!(grads.param_grads.len(), 1);
        assert_eq!(grads.param_grads[0].0, "a.weight");
    }

    #[test]
    fn test_backward_requires_forward() {
        let mut compute = SyntheticCompute::new(8);
        assert!(compute.backward(3, &params(), &[1.0]).is_err());
    }

    #[test]
    fn test_injected_overflow() {
        let mut compute = SyntheticCompute::new(8).with_overflow_at(1);
        let batch = batch();
        compute.forward(1, &params(), StageInput::Tokens(&batch)).unwrap();
        let grads = compute.backward(1, &params(), &[1.0, 1.0]).unwrap();
        assert!(grads.param_grads[0].1.iter().all(|g| g.is_infinite()));
    }
}
