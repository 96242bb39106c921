//! Dynamic loss scaler
//!
//! State machine per optimizer step:
//! `Unscaled -> Scaled` on the first `scale`, `Scaled -> Checked` once the
//! mesh-wide overflow flag is known, `Checked -> Applied | Skipped` on
//! `update`, which then adjusts the scale and returns to `Scaled`.

use serde::{Deserialize, Serialize};
use shardplan_types::{AmpConfig, Result, ShardplanError};
use tracing::{debug, warn};

/// Loss-scaler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalerState {
    Unscaled,
    Scaled,
    Checked,
    Applied,
    Skipped,
}

/// Outcome of one optimizer step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepDecision {
    Applied,
    /// Non-finite gradients somewhere on the mesh; parameters untouched
    Skipped,
}

/// Float16 loss scaler; a disabled scaler has a fixed scale of 1
#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled: bool,
    scale: f32,
    incr_ratio: f32,
    decr_ratio: f32,
    incr_every_n_steps: usize,
    decr_every_n_nan_or_inf: usize,
    good_steps: usize,
    bad_steps: usize,
    found_inf: bool,
    state: ScalerState,
    history: Vec<ScalerState>,
}

impl GradScaler {
    /// Scaler for a run; only float16 mixed precision scales the loss
    pub fn new(config: &AmpConfig) -> Self {
        let enabled = config.uses_loss_scaler();
        Self {
            enabled,
            scale: if enabled { config.init_loss_scaling } else { 1.0 },
            incr_ratio: config.incr_ratio,
            decr_ratio: config.decr_ratio,
            incr_every_n_steps: config.incr_every_n_steps.max(1),
            decr_every_n_nan_or_inf: config.decr_every_n_nan_or_inf.max(1),
            good_steps: 0,
            bad_steps: 0,
            found_inf: false,
            state: ScalerState::Unscaled,
            history: vec![ScalerState::Unscaled],
        }
    }

    pub fn disabled() -> Self {
        Self::new(&AmpConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current loss scale
    pub fn loss_scale(&self) -> f32 {
        self.scale
    }

    pub fn state(&self) -> ScalerState {
        self.state
    }

    /// Every state entered so far, starting with `Unscaled`
    pub fn history(&self) -> &[ScalerState] {
        &self.history
    }

    fn transition(&mut self, next: ScalerState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Loss scaler transition");
            self.state = next;
            self.history.push(next);
        }
    }

    /// Multiply a loss by the current scale
    pub fn scale(&mut self, loss: f32) -> Result<f32> {
        if !self.enabled {
            return Ok(loss);
        }
        match self.state {
            ScalerState::Unscaled | ScalerState::Scaled => {
                self.transition(ScalerState::Scaled);
                Ok(loss * self.scale)
            }
            state => Err(ShardplanError::internal(format!(
                "cannot scale a loss while the scaler is {:?}",
                state
            ))),
        }
    }

    /// Divide gradients by the scale in place; true if any value is not finite
    pub fn unscale(&self, grads: &mut [f32]) -> bool {
        if self.enabled {
            let inv = 1.0 / self.scale;
            grads.iter_mut().for_each(|g| *g *= inv);
        }
        grads.iter().any(|g| !g.is_finite())
    }

    /// Record the mesh-wide overflow flag for this step
    pub fn check(&mut self, found_inf: bool) -> Result<()> {
        self.found_inf = found_inf;
        if !self.enabled {
            return Ok(());
        }
        if self.state != ScalerState::Scaled {
            return Err(ShardplanError::internal(format!(
                "overflow check requires a scaled step, scaler is {:?}",
                self.state
            )));
        }
        self.transition(ScalerState::Checked);
        Ok(())
    }

    /// Decide the step and adjust the scale
    pub fn update(&mut self) -> Result<StepDecision> {
        if !self.enabled {
            return Ok(if self.found_inf {
                StepDecision::Skipped
            } else {
                StepDecision::Applied
            });
        }
        if self.state != ScalerState::Checked {
            return Err(ShardplanError::internal(format!(
                "scaler update requires a checked step, scaler is {:?}",
                self.state
            )));
        }

        let decision = if self.found_inf {
            self.transition(ScalerState::Skipped);
            self.good_steps = 0;
            self.bad_steps += 1;
            if self.bad_steps >= self.decr_every_n_nan_or_inf {
                self.scale = (self.scale * self.decr_ratio).max(f32::MIN_POSITIVE);
                self.bad_steps = 0;
            }
            warn!(scale = self.scale, "Non-finite gradients, backing off loss scale");
            StepDecision::Skipped
        } else {
            self.transition(ScalerState::Applied);
            self.bad_steps = 0;
            self.good_steps += 1;
            if self.good_steps >= self.incr_every_n_steps {
                self.scale *= self.incr_ratio;
                self.good_steps = 0;
                debug!(scale = self.scale, "Growing loss scale");
            }
            StepDecision::Applied
        };

        self.found_inf = false;
        self.transition(ScalerState::Scaled);
        Ok(decision)
    }
}
