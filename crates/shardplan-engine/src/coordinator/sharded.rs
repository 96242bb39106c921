//! Sharded execution coordinator
//!
//! Drives forward, backward and optimizer steps for one rank of the mesh:
//!
//! - the global batch is split by rows along `dp`
//! - micro-batches flow through the pipeline stages on the 1F1B schedule,
//!   activations and their gradients handed off point-to-point
//! - gradients accumulate into each shard's buffer until the window closes
//! - the optimizer step synchronises tied and replicated gradients, checks
//!   for overflow mesh-wide, clips by global norm and updates the local
//!   shard (or this rank's chunk of it under sharding stages 1 and 2)

use super::amp::{gradient_dtype, round_through};
use super::compute::{StageCompute, StageInput, StageParam};
use super::metrics::{CoordinatorMetrics, MetricsSnapshot};
use super::scaler::{GradScaler, StepDecision};
use crate::context::{MeshContext, DP_AXIS, MP_AXIS};
use crate::data::shard_batch;
use crate::model::ParamTensor;
use crate::parallel::PlannedModel;
use crate::pipeline::{one_f_one_b, PipelineOp};
use serde::{Deserialize, Serialize};
use shardplan_interfaces::{Batch, Communicator, LrScheduler, Optimizer, ProcessGroup, ReduceOp};
use shardplan_types::{DataType, Placement, Rank, Result, ShardplanError, TrainingConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const FORWARD: u64 = 0;
const BACKWARD: u64 = 1;

fn transfer_tag(micro: u64, kind: u64) -> u64 {
    micro * 2 + kind
}

/// Step-loop settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorSettings {
    /// Micro-steps per optimizer step
    pub acc_steps: usize,
    pub grad_clip_norm: Option<f32>,
    /// Reduced precision gradients are rounded through
    pub grad_dtype: Option<DataType>,
}

impl CoordinatorSettings {
    pub fn from_training(config: &TrainingConfig) -> Self {
        Self {
            acc_steps: config.acc_step.max(1),
            grad_clip_norm: config.optimizer.grad_clip_norm,
            grad_dtype: gradient_dtype(&config.amp),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            acc_steps: 1,
            grad_clip_norm: None,
            grad_dtype: None,
        }
    }
}

/// Collaborators the coordinator drives
pub struct CoordinatorParts {
    pub compute: Box<dyn StageCompute>,
    pub optimizer: Box<dyn Optimizer>,
    pub scheduler: Box<dyn LrScheduler>,
    pub scaler: GradScaler,
}

/// Result of one `step` or `train_window` call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Id of the (last) micro-batch run
    pub micro_step: u64,
    /// Loss of this call, on the last pipeline stage only
    pub loss: Option<f32>,
    /// Mean loss of the window the optimizer just closed
    pub window_loss: Option<f32>,
    /// Set when the optimizer step fired
    pub decision: Option<StepDecision>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Update {
    Full,
    Chunk { index: usize, parts: usize },
}

struct Groups {
    dp: ProcessGroup,
    mp: ProcessGroup,
    world: ProcessGroup,
    prev: Option<Rank>,
    next: Option<Rank>,
}

/// Training loop of one rank over its planned shards
pub struct ShardedCoordinator {
    context: MeshContext,
    comm: Arc<dyn Communicator>,
    model: PlannedModel,
    compute: Box<dyn StageCompute>,
    optimizer: Box<dyn Optimizer>,
    scheduler: Box<dyn LrScheduler>,
    scaler: GradScaler,
    settings: CoordinatorSettings,
    groups: Groups,
    dp_axis: Option<usize>,
    mp_axis: Option<usize>,
    micro_in_window: usize,
    tr_loss: f32,
    next_micro: u64,
    metrics: Arc<CoordinatorMetrics>,
}

impl ShardedCoordinator {
    pub fn new(
        context: MeshContext,
        comm: Arc<dyn Communicator>,
        model: PlannedModel,
        parts: CoordinatorParts,
        settings: CoordinatorSettings,
    ) -> Result<Self> {
        if comm.rank() != context.rank() {
            return Err(ShardplanError::config(format!(
                "communicator rank {} does not match context rank {}",
                comm.rank(),
                context.rank()
            )));
        }
        if settings.acc_steps == 0 {
            return Err(ShardplanError::config("acc_steps must be positive"));
        }
        let stage = model.stage;
        let groups = Groups {
            dp: context.group(DP_AXIS)?,
            mp: context.group(MP_AXIS)?,
            world: context.world_group(),
            prev: if stage > 0 {
                Some(context.peer_on_stage(stage - 1)?)
            } else {
                None
            },
            next: if stage + 1 < model.num_stages {
                Some(context.peer_on_stage(stage + 1)?)
            } else {
                None
            },
        };
        let axis = |name: &str| model.param_axes.iter().position(|(axis, _)| axis == name);
        let (dp_axis, mp_axis) = (axis(DP_AXIS), axis(MP_AXIS));

        debug!(
            rank = context.rank(),
            stage,
            dp = %groups.dp,
            mp = %groups.mp,
            "Coordinator ready"
        );
        Ok(Self {
            context,
            comm,
            model,
            compute: parts.compute,
            optimizer: parts.optimizer,
            scheduler: parts.scheduler,
            scaler: parts.scaler,
            settings,
            groups,
            dp_axis,
            mp_axis,
            micro_in_window: 0,
            tr_loss: 0.0,
            next_micro: 0,
            metrics: Arc::new(CoordinatorMetrics::new()),
        })
    }

    pub fn context(&self) -> &MeshContext {
        &self.context
    }

    pub fn model(&self) -> &PlannedModel {
        &self.model
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    pub fn metrics(&self) -> Arc<CoordinatorMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Loss accumulated in the open window, already divided by `acc_steps`
    pub fn accumulated_loss(&self) -> f32 {
        self.tr_loss
    }

    /// Micro-steps run since the last optimizer step
    pub fn pending_micro_steps(&self) -> usize {
        self.micro_in_window
    }

    /// Learning rate the next optimizer step will use
    pub fn learning_rate(&self) -> f32 {
        self.scheduler.get_lr()
    }

    pub fn optimizer_name(&self) -> &str {
        self.optimizer.name()
    }

    /// Run one micro-step on `batch`; the optimizer fires every `acc_steps` calls
    pub async fn step(&mut self, batch: &Batch) -> Result<StepOutcome> {
        let local = self.local_batch(batch)?;
        let micro = self.next_micro;
        self.next_micro += 1;
        let acc = self.settings.acc_steps as f32;

        let losses = self.run_schedule(&[(micro, local)], acc).await?;
        self.metrics.record_micro_step();
        let loss = losses.first().copied();
        if let Some(loss) = loss {
            self.tr_loss += loss / acc;
        }
        self.micro_in_window += 1;

        let mut outcome = StepOutcome {
            micro_step: micro,
            loss,
            window_loss: None,
            decision: None,
        };
        if self.micro_in_window == self.settings.acc_steps {
            let (decision, window_loss) = self.finish_window().await?;
            outcome.decision = Some(decision);
            outcome.window_loss = window_loss;
        }
        Ok(outcome)
    }

    /// Run `batches` as one accumulation window on the 1F1B schedule, then step
    pub async fn train_window(&mut self, batches: &[Batch]) -> Result<StepOutcome> {
        if batches.is_empty() {
            return Err(ShardplanError::config("a training window needs at least one batch"));
        }
        if self.micro_in_window != 0 {
            return Err(ShardplanError::execution(format!(
                "{} micro-steps are still pending in the open window",
                self.micro_in_window
            )));
        }
        let mut micros = Vec::with_capacity(batches.len());
        for batch in batches {
            micros.push((self.next_micro, self.local_batch(batch)?));
            self.next_micro += 1;
        }
        let count = micros.len() as f32;

        let losses = self.run_schedule(&micros, count).await?;
        for _ in &micros {
            self.metrics.record_micro_step();
        }
        let loss = (!losses.is_empty()).then(|| losses.iter().sum::<f32>() / count);
        self.tr_loss = loss.unwrap_or(0.0);
        self.micro_in_window = micros.len();

        let (decision, window_loss) = self.finish_window().await?;
        Ok(StepOutcome {
            micro_step: self.next_micro - 1,
            loss,
            window_loss,
            decision: Some(decision),
        })
    }

    fn local_batch(&self, batch: &Batch) -> Result<Batch> {
        let index = self.groups.dp.index_of(self.context.rank()).unwrap_or(0);
        shard_batch(batch, index, self.groups.dp.size())
    }

    fn is_dp_sharded(&self, param: &ParamTensor) -> bool {
        !self.groups.dp.is_trivial()
            && self
                .dp_axis
                .and_then(|axis| param.placements().get(axis))
                .map(|p| *p == Placement::Shard(0))
                .unwrap_or(false)
    }

    fn is_mp_replicated(&self, param: &ParamTensor) -> bool {
        !self.groups.mp.is_trivial()
            && self
                .mp_axis
                .and_then(|axis| param.placements().get(axis))
                .map(|p| *p == Placement::Replicate)
                .unwrap_or(false)
    }

    fn param(&self, path: &str) -> Result<&ParamTensor> {
        self.model
            .root
            .find_param(path)
            .ok_or_else(|| ShardplanError::not_found(format!("parameter '{}'", path)))
    }

    fn param_mut(&mut self, path: &str) -> Result<&mut ParamTensor> {
        self.model
            .root
            .find_param_mut(path)
            .ok_or_else(|| ShardplanError::not_found(format!("parameter '{}'", path)))
    }

    /// Local parameters as the stage computes with them; stage-3 shards are
    /// gathered along `dp` first
    async fn stage_params(&self) -> Result<Vec<StageParam>> {
        let mut params = Vec::new();
        for (path, param) in self.model.root.named_parameters() {
            let Some(data) = param.data() else {
                continue;
            };
            let data = if self.is_dp_sharded(param) {
                self.comm.all_gather(&self.groups.dp, data).await?.concat()
            } else {
                data.to_vec()
            };
            params.push(StageParam {
                path,
                data,
                trainable: param.trainable,
            });
        }
        Ok(params)
    }

    /// Forward and backward of `micros` on this stage; losses on the last stage
    async fn run_schedule(&mut self, micros: &[(u64, Batch)], divisor: f32) -> Result<Vec<f32>> {
        let params = self.stage_params().await?;
        let factor = self.scaler.scale(1.0)?;
        let ops = one_f_one_b(self.model.num_stages, self.model.stage, micros.len());
        let mut seeds: HashMap<usize, Vec<f32>> = HashMap::new();
        let mut losses = Vec::new();

        for op in ops {
            match op {
                PipelineOp::Forward(i) => {
                    let (micro, batch) = &micros[i];
                    let input = match self.groups.prev {
                        None => StageInput::Tokens(batch),
                        Some(prev) => StageInput::Activation(
                            self.comm.recv(prev, transfer_tag(*micro, FORWARD)).await?,
                        ),
                    };
                    let output = self.compute.forward(*micro, &params, input)?;
                    match self.groups.next {
                        Some(next) => {
                            self.comm
                                .send(next, transfer_tag(*micro, FORWARD), output)
                                .await?
                        }
                        None => {
                            let (loss, grad) = self.compute.loss(*micro, &output, batch)?;
                            let mut reduced = [loss];
                            self.comm
                                .all_reduce(&self.groups.mp, &mut reduced, ReduceOp::Mean)
                                .await?;
                            losses.push(reduced[0]);
                            seeds.insert(i, grad.iter().map(|g| g * factor / divisor).collect());
                        }
                    }
                }
                PipelineOp::Backward(i) => {
                    let micro = micros[i].0;
                    let grad_output = match self.groups.next {
                        None => seeds.remove(&i).ok_or_else(|| {
                            ShardplanError::internal(format!("no loss gradient for micro-batch {}", micro))
                        })?,
                        Some(next) => self.comm.recv(next, transfer_tag(micro, BACKWARD)).await?,
                    };
                    let grads = self.compute.backward(micro, &params, &grad_output)?;
                    if let Some(prev) = self.groups.prev {
                        self.comm
                            .send(prev, transfer_tag(micro, BACKWARD), grads.input_grad)
                            .await?;
                    }
                    self.accumulate(grads.param_grads).await?;
                }
            }
        }
        Ok(losses)
    }

    async fn accumulate(&mut self, grads: Vec<(String, Vec<f32>)>) -> Result<()> {
        for (path, mut grad) in grads {
            if let Some(dtype) = self.settings.grad_dtype {
                round_through(&mut grad, dtype);
            }
            if self.is_dp_sharded(self.param(&path)?) {
                grad = self
                    .comm
                    .reduce_scatter(&self.groups.dp, &grad, ReduceOp::Mean)
                    .await?;
            }
            let param = self.param_mut(&path)?;
            if grad.len() != param.local_numel() {
                return Err(ShardplanError::execution(format!(
                    "gradient of '{}' has {} values, local shard has {}",
                    path,
                    grad.len(),
                    param.local_numel()
                )));
            }
            match param.grad.as_mut() {
                Some(acc) => acc.iter_mut().zip(&grad).for_each(|(a, g)| *a += g),
                None => param.grad = Some(grad),
            }
        }
        Ok(())
    }

    async fn finish_window(&mut self) -> Result<(StepDecision, Option<f32>)> {
        let lr = self.scheduler.get_lr();
        let decision = self.optimizer_step(lr).await?;
        self.scheduler.step();

        let window_loss = self.model.is_last_stage().then_some(self.tr_loss);
        self.tr_loss = 0.0;
        self.micro_in_window = 0;
        self.metrics.record_optimizer_step(decision == StepDecision::Skipped);

        info!(
            rank = self.context.rank(),
            stage = self.model.stage,
            loss = ?window_loss,
            lr,
            scale = self.scaler.loss_scale(),
            decision = ?decision,
            "Optimizer step"
        );
        Ok((decision, window_loss))
    }

    async fn optimizer_step(&mut self, lr: f32) -> Result<StepDecision> {
        let paths = self.model.local_trainable();
        for path in &paths {
            let param = self.param_mut(path)?;
            if param.grad.is_none() {
                param.grad = Some(vec![0.0; param.local_numel()]);
            }
        }

        self.sync_shared_weights().await?;
        self.sync_model_parallel(&paths).await?;
        let mut updates = self.sync_data_parallel(&paths).await?;

        let mut found_inf = false;
        for (_, _, grad) in updates.iter_mut() {
            found_inf |= self.scaler.unscale(grad);
        }
        let mut flag = [if found_inf { 1.0 } else { 0.0 }];
        self.comm
            .all_reduce(&self.groups.world, &mut flag, ReduceOp::Max)
            .await?;
        self.scaler.check(flag[0] > 0.0)?;
        let decision = self.scaler.update()?;

        if decision == StepDecision::Applied {
            let coefficient = self.clip_coefficient(&updates).await?;
            for (path, update, mut grad) in updates {
                if coefficient < 1.0 {
                    grad.iter_mut().for_each(|g| *g *= coefficient);
                }
                self.apply_update(&path, update, &grad, lr).await?;
            }
        } else {
            let err = ShardplanError::numeric_overflow("non-finite gradients on the mesh");
            warn!(rank = self.context.rank(), error = %err, "Skipping optimizer step");
        }

        self.model.root.for_each_param_mut(&mut |_, param| {
            param.grad = None;
            Ok(())
        })?;
        Ok(decision)
    }

    /// Sum gradients of tied parameters so both copies take the same update
    async fn sync_shared_weights(&mut self) -> Result<()> {
        let stage = self.model.stage;
        for shared in self.model.shared_weights.clone() {
            if shared.source_stage == shared.tied_stage {
                if stage != shared.source_stage {
                    continue;
                }
                let (Some(a), Some(b)) = (
                    self.param(&shared.source)?.grad.clone(),
                    self.param(&shared.tied)?.grad.clone(),
                ) else {
                    continue;
                };
                let sum: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
                self.param_mut(&shared.source)?.grad = Some(sum.clone());
                self.param_mut(&shared.tied)?.grad = Some(sum);
            } else if stage == shared.source_stage || stage == shared.tied_stage {
                let path = if stage == shared.source_stage {
                    &shared.source
                } else {
                    &shared.tied
                };
                let Some(mut grad) = self.param(path)?.grad.clone() else {
                    continue;
                };
                let mut ranks = vec![
                    self.context.peer_on_stage(shared.source_stage)?,
                    self.context.peer_on_stage(shared.tied_stage)?,
                ];
                ranks.sort_unstable();
                self.comm
                    .all_reduce(&ProcessGroup::new(ranks), &mut grad, ReduceOp::Sum)
                    .await?;
                self.param_mut(path)?.grad = Some(grad);
            }
        }
        Ok(())
    }

    /// Average gradients of parameters replicated along `mp`
    async fn sync_model_parallel(&mut self, paths: &[String]) -> Result<()> {
        if self.groups.mp.is_trivial() {
            return Ok(());
        }
        for path in paths {
            let param = self.param(path)?;
            if !self.is_mp_replicated(param) {
                continue;
            }
            let Some(mut grad) = param.grad.clone() else {
                continue;
            };
            self.comm
                .all_reduce(&self.groups.mp, &mut grad, ReduceOp::Mean)
                .await?;
            self.param_mut(path)?.grad = Some(grad);
        }
        Ok(())
    }

    /// Average gradients along `dp`; returns the gradient each update consumes
    async fn sync_data_parallel(&mut self, paths: &[String]) -> Result<Vec<(String, Update, Vec<f32>)>> {
        let parts = self.groups.dp.size();
        let index = self.groups.dp.index_of(self.context.rank()).unwrap_or(0);
        let stage = self.model.sharding_stage;
        let mut updates = Vec::with_capacity(paths.len());

        for path in paths {
            let param = self.param(path)?;
            let sharded = self.is_dp_sharded(param);
            let grad = param.grad.clone().unwrap_or_default();
            if parts == 1 || sharded {
                updates.push((path.clone(), Update::Full, grad));
                continue;
            }

            let divisible = grad.len() % parts == 0;
            if stage.shards_gradients() && divisible {
                let chunk = self
                    .comm
                    .reduce_scatter(&self.groups.dp, &grad, ReduceOp::Mean)
                    .await?;
                updates.push((path.clone(), Update::Chunk { index, parts }, chunk));
                continue;
            }

            let mut grad = grad;
            self.comm
                .all_reduce(&self.groups.dp, &mut grad, ReduceOp::Mean)
                .await?;
            if stage.shards_optimizer() && divisible {
                let size = grad.len() / parts;
                let chunk = grad[index * size..(index + 1) * size].to_vec();
                updates.push((path.clone(), Update::Chunk { index, parts }, chunk));
            } else {
                updates.push((path.clone(), Update::Full, grad));
            }
        }
        Ok(updates)
    }

    /// Global-norm clip coefficient; each distinct gradient value counts once
    async fn clip_coefficient(&self, updates: &[(String, Update, Vec<f32>)]) -> Result<f32> {
        let Some(max_norm) = self.settings.grad_clip_norm else {
            return Ok(1.0);
        };
        let mut local = 0.0f64;
        for (path, update, grad) in updates {
            let param = self.param(path)?;
            let mut weight = 1.0f64;
            if *update == Update::Full && !self.is_dp_sharded(param) {
                weight /= self.groups.dp.size() as f64;
            }
            if self.is_mp_replicated(param) {
                weight /= self.groups.mp.size() as f64;
            }
            let tied = param.tied_to().is_some()
                || self.model.shared_weights.iter().any(|s| &s.source == path);
            if tied {
                weight *= 0.5;
            }
            let sum: f64 = grad.iter().map(|g| (*g as f64) * (*g as f64)).sum();
            local += weight * sum;
        }

        let mut total = [local as f32];
        self.comm
            .all_reduce(&self.groups.world, &mut total, ReduceOp::Sum)
            .await?;
        let norm = total[0].max(0.0).sqrt();
        debug!(norm, max_norm, "Global gradient norm");
        Ok(max_norm / norm.max(max_norm))
    }

    async fn apply_update(&mut self, path: &str, update: Update, grad: &[f32], lr: f32) -> Result<()> {
        let param = self
            .model
            .root
            .find_param_mut(path)
            .ok_or_else(|| ShardplanError::not_found(format!("parameter '{}'", path)))?;
        let apply_decay = !param.is_decay_exempt(path);
        let data = param
            .data_mut()
            .ok_or_else(|| ShardplanError::internal(format!("'{}' has no local data", path)))?;

        match update {
            Update::Full => self.optimizer.update(path, data, grad, lr, apply_decay),
            Update::Chunk { index, parts } => {
                let size = data.len() / parts;
                let range = index * size..(index + 1) * size;
                let key = format!("{}#{}", path, index);
                self.optimizer
                    .update(&key, &mut data[range.clone()], grad, lr, apply_decay)?;
                let mine = data[range].to_vec();

                let gathered = self.comm.all_gather(&self.groups.dp, &mine).await?.concat();
                self.param_mut(path)?.set_data(gathered)
            }
        }
    }
}
