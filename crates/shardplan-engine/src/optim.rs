//! Reference optimizers and learning-rate schedule

use shardplan_interfaces::{LrScheduler, Optimizer};
use shardplan_types::{OptimizerConfig, OptimizerKind, Result, ShardplanError};
use std::collections::HashMap;

fn check_lengths(key: &str, param: &[f32], grad: &[f32]) -> Result<()> {
    if param.len() != grad.len() {
        return Err(ShardplanError::execution(format!(
            "'{}': {} parameter values but {} gradient values",
            key,
            param.len(),
            grad.len()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
struct AdamState {
    step: i32,
    m: Vec<f32>,
    v: Vec<f32>,
}

/// Adam with decoupled weight decay
#[derive(Debug, Clone)]
pub struct AdamW {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    states: HashMap<String, AdamState>,
}

impl AdamW {
    pub fn new(weight_decay: f32) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            states: HashMap::new(),
        }
    }

    /// Update count of the shard at `key`
    pub fn step_count(&self, key: &str) -> usize {
        self.states.get(key).map(|s| s.step as usize).unwrap_or(0)
    }
}

impl Optimizer for AdamW {
    fn name(&self) -> &str {
        "adamw"
    }

    fn update(
        &mut self,
        key: &str,
        param: &mut [f32],
        grad: &[f32],
        lr: f32,
        apply_decay: bool,
    ) -> Result<()> {
        check_lengths(key, param, grad)?;
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.epsilon);
        let state = self.states.entry(key.to_string()).or_insert_with(|| AdamState {
            step: 0,
            m: vec![0.0; param.len()],
            v: vec![0.0; param.len()],
        });
        state.step += 1;
        let bias1 = 1.0 - beta1.powi(state.step);
        let bias2 = 1.0 - beta2.powi(state.step);
        let decay = if apply_decay { self.weight_decay } else { 0.0 };

        for (i, (p, g)) in param.iter_mut().zip(grad).enumerate() {
            state.m[i] = beta1 * state.m[i] + (1.0 - beta1) * g;
            state.v[i] = beta2 * state.v[i] + (1.0 - beta2) * g * g;
            let m_hat = state.m[i] / bias1;
            let v_hat = state.v[i] / bias2;
            *p -= lr * decay * *p;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        }
        Ok(())
    }

    fn state_len(&self, key: &str) -> usize {
        self.states
            .get(key)
            .map(|s| s.m.len() + s.v.len())
            .unwrap_or(0)
    }
}

/// Plain gradient descent with optional decoupled decay
#[derive(Debug, Clone, Default)]
pub struct Sgd {
    weight_decay: f32,
}

impl Sgd {
    pub fn new(weight_decay: f32) -> Self {
        Self { weight_decay }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn update(
        &mut self,
        key: &str,
        param: &mut [f32],
        grad: &[f32],
        lr: f32,
        apply_decay: bool,
    ) -> Result<()> {
        check_lengths(key, param, grad)?;
        let decay = if apply_decay { self.weight_decay } else { 0.0 };
        for (p, g) in param.iter_mut().zip(grad) {
            *p -= lr * (g + decay * *p);
        }
        Ok(())
    }

    fn state_len(&self, _key: &str) -> usize {
        0
    }
}

/// Linear ramp from `start_lr` to `target_lr` over `warmup_steps`, constant after
#[derive(Debug, Clone)]
pub struct LinearWarmup {
    target_lr: f32,
    start_lr: f32,
    warmup_steps: usize,
    step: usize,
}

impl LinearWarmup {
    pub fn new(target_lr: f32, warmup_steps: usize, start_lr: f32) -> Self {
        Self {
            target_lr,
            start_lr,
            warmup_steps,
            step: 0,
        }
    }

    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self::new(config.learning_rate, config.warmup_steps, config.start_lr)
    }
}

impl LrScheduler for LinearWarmup {
    fn get_lr(&self) -> f32 {
        if self.step >= self.warmup_steps {
            return self.target_lr;
        }
        let progress = self.step as f32 / self.warmup_steps as f32;
        self.start_lr + (self.target_lr - self.start_lr) * progress
    }

    fn step(&mut self) {
        self.step += 1;
    }

    fn last_step(&self) -> usize {
        self.step
    }
}

/// Optimizer for a run's configuration
pub fn create_optimizer(config: &OptimizerConfig) -> Box<dyn Optimizer> {
    match config.kind {
        OptimizerKind::AdamW => Box::new(AdamW::new(config.weight_decay)),
        OptimizerKind::Sgd => Box::new(Sgd::new(config.weight_decay)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_ramp() {
        let mut schedule = LinearWarmup::new(1e-4, 2, 0.0);
        assert_eq!(schedule.get_lr(), 0.0);
        schedule.step();
        assert!((schedule.get_lr() - 5e-5).abs() < 1e-9);
        schedule.step();
        schedule.step();
        assert_eq!(schedule.get_lr(), 1e-4);
        assert_eq!(schedule.last_step(), 3);
    }

    #[test]
    fn test_adamw_first_step_moves_by_lr() {
        let mut adam = AdamW::new(0.0);
        let mut param = vec![1.0, -1.0];
        adam.update("w", &mut param, &[0.5, -2.0], 0.1, true).unwrap();
        assert!((param[0] - 0.9).abs() < 1e-5);
        assert!((param[1] + 0.9).abs() < 1e-5);
        assert_eq!(adam.step_count("w"), 1);
        assert_eq!(adam.state_len("w"), 4);
    }

    #[test]
    fn test_decay_only_when_requested() {
        let mut adam = AdamW::new(0.5);
        let mut decayed = vec![2.0];
        let mut exempt = vec![2.0];
        adam.update("a", &mut decayed, &[0.0], 0.1, true).unwrap();
        adam.update("b", &mut exempt, &[0.0], 0.1, false).unwrap();
        assert!((decayed[0] - 1.9).abs() < 1e-6);
        assert_eq!(exempt[0], 2.0);
    }

    #[test]
    fn test_sgd_and_length_check() {
        let mut sgd = Sgd::new(0.0);
        let mut param = vec![1.0];
        sgd.update("w", &mut param, &[2.0], 0.5, true).unwrap();
        assert_eq!(param, vec![0.0]);
        assert!(sgd.update("w", &mut param, &[1.0, 2.0], 0.5, true).is_err());
    }

    #[test]
    fn test_create_optimizer_by_kind() {
        let config = OptimizerConfig {
            kind: OptimizerKind::Sgd,
            ..OptimizerConfig::default()
        };
        assert_eq!(create_optimizer(&config).name(), "sgd");
        assert_eq!(create_optimizer(&OptimizerConfig::default()).name(), "adamw");
    }
}
