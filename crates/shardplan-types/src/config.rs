//! Configuration types for shardplan components
//!
//! Training runs are configured through environment-style key/value pairs
//! (`dp=2 mp=2 pp=1 acc_step=4 amp=true ...`). [`TrainingConfig::from_env`]
//! reads the process environment, [`TrainingConfig::from_lookup`] accepts any
//! key lookup and [`TrainingConfig::from_file`] loads the same shape from TOML.

use crate::{DataType, Result, ShardplanError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Parallel degrees and data-parallel sharding level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Data-parallel degree
    pub dp: usize,
    /// Tensor (model) parallel degree
    pub mp: usize,
    /// Pipeline-parallel degree
    pub pp: usize,
    /// Data-parallel state sharding level
    pub sharding_stage: ShardingStage,
    /// Shard activations along the sequence dimension between tensor-parallel regions
    pub sequence_parallel: bool,
    /// Use per-layer sequence-parallel enable markers instead of begin/end markers
    pub prepare_input_output: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            dp: 1,
            mp: 1,
            pp: 1,
            sharding_stage: ShardingStage::Stage0,
            sequence_parallel: false,
            prepare_input_output: false,
        }
    }
}

impl ParallelConfig {
    /// Total number of ranks implied by the parallel degrees
    pub fn world_size(&self) -> usize {
        self.dp * self.mp * self.pp
    }

    /// Check if any parallelism is enabled
    pub fn is_parallel(&self) -> bool {
        self.world_size() > 1
    }

    /// Mesh axes in declaration order. Collapses to the data-parallel axis
    /// alone when neither pipeline nor tensor parallelism is requested.
    pub fn mesh_dims(&self) -> Vec<(String, usize)> {
        if self.pp * self.mp == 1 {
            vec![("dp".to_string(), self.dp)]
        } else {
            vec![
                ("dp".to_string(), self.dp),
                ("pp".to_string(), self.pp),
                ("mp".to_string(), self.mp),
            ]
        }
    }
}

/// Data-parallel state sharding level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShardingStage {
    /// Plain data parallelism: everything replicated
    Stage0,
    /// Optimizer updates partitioned across data-parallel ranks
    Stage1,
    /// Stage 1 plus reduce-scattered gradients
    Stage2,
    /// Stage 2 plus parameters sharded along the data-parallel axis
    Stage3,
}

impl ShardingStage {
    /// Parse a level identifier such as `"1"` or `"stage2"`
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().trim_start_matches("stage") {
            "" | "0" => Ok(ShardingStage::Stage0),
            "1" => Ok(ShardingStage::Stage1),
            "2" => Ok(ShardingStage::Stage2),
            "3" => Ok(ShardingStage::Stage3),
            _ => Err(ShardplanError::config(format!(
                "Invalid sharding stage: {}",
                value
            ))),
        }
    }

    /// Whether optimizer updates are partitioned across data-parallel ranks
    pub fn shards_optimizer(&self) -> bool {
        *self >= ShardingStage::Stage1
    }

    /// Whether gradients are reduce-scattered rather than all-reduced
    pub fn shards_gradients(&self) -> bool {
        *self >= ShardingStage::Stage2
    }

    /// Whether parameters themselves are sharded along the data-parallel axis
    pub fn shards_parameters(&self) -> bool {
        *self >= ShardingStage::Stage3
    }
}

impl Default for ShardingStage {
    fn default() -> Self {
        ShardingStage::Stage0
    }
}

/// Reduced-precision element type for mixed precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AmpDtype {
    Float16,
    Bfloat16,
}

impl AmpDtype {
    /// Parse `float16` / `bfloat16`; anything else is `None`
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "float16" => Some(AmpDtype::Float16),
            "bfloat16" => Some(AmpDtype::Bfloat16),
            _ => None,
        }
    }

    /// Matching tensor data type
    pub fn data_type(&self) -> DataType {
        match self {
            AmpDtype::Float16 => DataType::FP16,
            AmpDtype::Bfloat16 => DataType::BF16,
        }
    }
}

/// Mixed precision level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AmpLevel {
    /// Everything in fp32
    O0,
    /// Autocast selected ops; parameters stay fp32
    O1,
    /// Parameters cast to the reduced dtype (norms excepted)
    O2,
}

impl AmpLevel {
    /// Parse `O0` / `O1` / `O2`; anything else is `None`
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "O0" => Some(AmpLevel::O0),
            "O1" => Some(AmpLevel::O1),
            "O2" => Some(AmpLevel::O2),
            _ => None,
        }
    }
}

/// Mixed precision and loss-scaling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmpConfig {
    /// Enable mixed precision
    pub enable: bool,
    /// Reduced-precision dtype
    pub dtype: AmpDtype,
    /// Mixed precision level
    pub level: AmpLevel,
    /// Keep gradients in fp32
    pub master_grad: bool,
    /// Initial loss scale
    pub init_loss_scaling: f32,
    /// Scale growth factor after `incr_every_n_steps` clean steps
    pub incr_ratio: f32,
    /// Scale backoff factor after `decr_every_n_nan_or_inf` overflowing steps
    pub decr_ratio: f32,
    /// Consecutive clean steps before growing the scale
    pub incr_every_n_steps: usize,
    /// Consecutive overflowing steps before shrinking the scale
    pub decr_every_n_nan_or_inf: usize,
}

impl Default for AmpConfig {
    fn default() -> Self {
        Self {
            enable: false,
            dtype: AmpDtype::Float16,
            level: AmpLevel::O1,
            master_grad: false,
            init_loss_scaling: 1024.0,
            incr_ratio: 2.0,
            decr_ratio: 0.5,
            incr_every_n_steps: 1000,
            decr_every_n_nan_or_inf: 1,
        }
    }
}

impl AmpConfig {
    /// Mixed precision is in effect (enabled and not level O0)
    pub fn is_active(&self) -> bool {
        self.enable && self.level != AmpLevel::O0
    }

    /// Dynamic loss scaling is only needed for float16
    pub fn uses_loss_scaler(&self) -> bool {
        self.is_active() && self.dtype == AmpDtype::Float16
    }

    /// Compute dtype for a parameter, given whether it belongs to a norm layer
    pub fn parameter_dtype(&self, is_norm: bool) -> DataType {
        if self.is_active() && self.level == AmpLevel::O2 && !is_norm {
            self.dtype.data_type()
        } else {
            DataType::FP32
        }
    }
}

/// Parameter update rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    AdamW,
    Sgd,
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::AdamW
    }
}

/// Optimizer and learning-rate schedule configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Update rule
    pub kind: OptimizerKind,
    /// Peak learning rate
    pub learning_rate: f32,
    /// Linear warmup steps
    pub warmup_steps: usize,
    /// Learning rate at step 0 of warmup
    pub start_lr: f32,
    /// Decoupled weight decay (not applied to bias/norm parameters)
    pub weight_decay: f32,
    /// Global-norm gradient clipping threshold
    pub grad_clip_norm: Option<f32>,
    /// Global micro-batch size before data-parallel sharding
    pub batch_size: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::AdamW,
            learning_rate: 1e-4,
            warmup_steps: 2,
            start_lr: 0.0,
            weight_decay: 0.01,
            grad_clip_norm: Some(1.0),
            batch_size: 2,
        }
    }
}

/// Decoder-only transformer dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlamaConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub seq_length: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub rms_norm_eps: f32,
}

impl Default for LlamaConfig {
    fn default() -> Self {
        Self {
            vocab_size: 8192,
            hidden_size: 512,
            intermediate_size: 2048,
            seq_length: 512,
            num_hidden_layers: 2,
            num_attention_heads: 8,
            rms_norm_eps: 1e-6,
        }
    }
}

impl LlamaConfig {
    /// Tiny dimensions for tests and dry runs
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            hidden_size: 16,
            intermediate_size: 32,
            seq_length: 8,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            rms_norm_eps: 1e-6,
        }
    }
}

/// Low-rank adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    /// Adapter rank
    pub r: usize,
    /// Scaling numerator (`alpha / r`)
    pub lora_alpha: f32,
    pub lora_dropout: f32,
    /// Keep biases of adapted layers trainable
    pub trainable_bias: bool,
    /// Regexes over full layer paths selecting adapted linears
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 8,
            lora_alpha: 8.0,
            lora_dropout: 0.0,
            trainable_bias: false,
            target_modules: [
                ".*q_proj.*",
                ".*v_proj.*",
                ".*k_proj.*",
                ".*o_proj.*",
                ".*qkv_proj.*",
                ".*gate_proj.*",
                ".*down_proj.*",
                ".*up_proj.*",
                ".*gate_up_fused_proj.*",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl LoraConfig {
    /// Scaling applied to the adapter product
    pub fn scaling(&self) -> f32 {
        self.lora_alpha / self.r as f32
    }
}

/// Full configuration of one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub parallel: ParallelConfig,
    pub amp: AmpConfig,
    pub optimizer: OptimizerConfig,
    pub model: LlamaConfig,
    pub lora: LoraConfig,
    /// Gradient accumulation steps
    pub acc_step: usize,
    /// Deterministic RNG seed
    pub seed: u64,
    /// Build parameters without storage and materialize only local shards
    pub use_lazy_init: bool,
    /// Tie `lm_head.weight` to the token embedding
    pub share_embedding: bool,
    /// Add a learned position embedding
    pub position_embedding: bool,
    /// Wrap the model with low-rank adapters
    pub enable_lora: bool,
    /// Optimizer steps to run before stopping
    pub max_steps: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            parallel: ParallelConfig::default(),
            amp: AmpConfig::default(),
            optimizer: OptimizerConfig::default(),
            model: LlamaConfig::default(),
            lora: LoraConfig::default(),
            acc_step: 1,
            seed: 2024,
            use_lazy_init: false,
            share_embedding: false,
            position_embedding: false,
            enable_lora: false,
            max_steps: 3,
        }
    }
}

impl TrainingConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Parallel degrees
        if let Some(dp) = lookup("dp") {
            config.parallel.dp = parse_usize("dp", &dp)?;
        }
        if let Some(mp) = lookup("mp") {
            config.parallel.mp = parse_usize("mp", &mp)?;
        }
        if let Some(pp) = lookup("pp") {
            config.parallel.pp = parse_usize("pp", &pp)?;
        }
        if let Some(level) = lookup("sharding_stage") {
            config.parallel.sharding_stage = ShardingStage::parse(&level)?;
        }
        if let Some(sp) = lookup("sequence_parallel") {
            config.parallel.sequence_parallel = parse_flag("sequence_parallel", &sp)?;
        }
        if let Some(pio) = lookup("prepare_input_output") {
            if parse_flag("prepare_input_output", &pio)? {
                config.parallel.prepare_input_output = true;
                config.parallel.sequence_parallel = true;
            }
        }

        // Accumulation
        if let Some(acc) = lookup("acc_step") {
            config.acc_step = parse_usize("acc_step", &acc)?;
        }

        // Mixed precision: unrecognised dtype/level values keep the defaults
        if let Some(amp) = lookup("amp") {
            config.amp.enable = parse_flag("amp", &amp)?;
        }
        if let Some(dtype) = lookup("amp_dtype").and_then(|v| AmpDtype::parse(&v)) {
            config.amp.dtype = dtype;
        }
        if let Some(level) = lookup("amp_level").and_then(|v| AmpLevel::parse(&v)) {
            config.amp.level = level;
        }
        if let Some(master_grad) = lookup("amp_master_grad") {
            config.amp.master_grad = parse_flag("amp_master_grad", &master_grad)?;
        }

        // Model shape and feature toggles
        if let Some(layers) = lookup("num_hidden_layers").filter(|v| !v.is_empty()) {
            config.model.num_hidden_layers = parse_usize("num_hidden_layers", &layers)?;
        }
        if let Some(seed) = lookup("seed") {
            config.seed = seed
                .trim()
                .parse()
                .map_err(|_| ShardplanError::config(format!("Invalid seed: {}", seed)))?;
        }
        if let Some(lazy) = lookup("use_lazy_init") {
            config.use_lazy_init = parse_flag("use_lazy_init", &lazy)?;
        }
        if let Some(share) = lookup("test_share_embedding") {
            config.share_embedding = parse_flag("test_share_embedding", &share)?;
        }
        if let Some(pos) = lookup("test_position_embedding") {
            config.position_embedding = parse_flag("test_position_embedding", &pos)?;
        }
        if let Some(lora) = lookup("test_lora") {
            config.enable_lora = parse_flag("test_lora", &lora)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ShardplanError::config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("dp", self.parallel.dp),
            ("mp", self.parallel.mp),
            ("pp", self.parallel.pp),
            ("acc_step", self.acc_step),
            ("num_hidden_layers", self.model.num_hidden_layers),
            ("batch_size", self.optimizer.batch_size),
        ] {
            if value == 0 {
                return Err(ShardplanError::config(format!(
                    "{} must be a positive integer",
                    name
                )));
            }
        }
        if self.enable_lora && self.lora.r == 0 {
            return Err(ShardplanError::config("LoRA rank must be positive"));
        }
        if self.amp.init_loss_scaling <= 0.0 {
            return Err(ShardplanError::config("Initial loss scaling must be positive"));
        }
        Ok(())
    }

    /// Total number of ranks
    pub fn world_size(&self) -> usize {
        self.parallel.world_size()
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| ShardplanError::config(format!("Invalid {}: {}", key, value)))
}

/// Accepts `true/false`, `1/0`, `yes/no` and the empty string (false)
fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(ShardplanError::config(format!(
            "Invalid {} flag: {}",
            key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_follow_harness() {
        let config = TrainingConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.world_size(), 1);
        assert_eq!(config.acc_step, 1);
        assert_eq!(config.seed, 2024);
        assert!(!config.amp.enable);
        assert_eq!(config.amp.dtype, AmpDtype::Float16);
        assert_eq!(config.amp.level, AmpLevel::O1);
        assert_eq!(config.parallel.sharding_stage, ShardingStage::Stage0);
    }

    #[test]
    fn test_parallel_degrees() {
        let config =
            TrainingConfig::from_lookup(lookup_from(&[("dp", "2"), ("mp", "2"), ("pp", "2")]))
                .unwrap();
        assert_eq!(config.world_size(), 8);
        assert_eq!(
            config.parallel.mesh_dims(),
            vec![
                ("dp".to_string(), 2),
                ("pp".to_string(), 2),
                ("mp".to_string(), 2)
            ]
        );
    }

    #[test]
    fn test_mesh_dims_collapse_to_dp() {
        let config = TrainingConfig::from_lookup(lookup_from(&[("dp", "4")])).unwrap();
        assert_eq!(config.parallel.mesh_dims(), vec![("dp".to_string(), 4)]);
    }

    #[test]
    fn test_prepare_input_output_implies_sequence_parallel() {
        let config =
            TrainingConfig::from_lookup(lookup_from(&[("prepare_input_output", "true")])).unwrap();
        assert!(config.parallel.sequence_parallel);
        assert!(config.parallel.prepare_input_output);
    }

    #[test]
    fn test_unknown_amp_values_keep_defaults() {
        let config = TrainingConfig::from_lookup(lookup_from(&[
            ("amp", "true"),
            ("amp_dtype", "float8"),
            ("amp_level", "O3"),
        ]))
        .unwrap();
        assert!(config.amp.enable);
        assert_eq!(config.amp.dtype, AmpDtype::Float16);
        assert_eq!(config.amp.level, AmpLevel::O1);
    }

    #[test]
    fn test_rejects_zero_and_garbage() {
        assert!(TrainingConfig::from_lookup(lookup_from(&[("dp", "0")])).is_err());
        assert!(TrainingConfig::from_lookup(lookup_from(&[("acc_step", "x")])).is_err());
        assert!(TrainingConfig::from_lookup(lookup_from(&[("amp", "maybe")])).is_err());
    }

    #[test]
    fn test_feature_toggles_accept_digits() {
        let config = TrainingConfig::from_lookup(lookup_from(&[
            ("test_lora", "1"),
            ("test_share_embedding", "0"),
            ("test_position_embedding", "1"),
        ]))
        .unwrap();
        assert!(config.enable_lora);
        assert!(!config.share_embedding);
        assert!(config.position_embedding);
    }

    #[test]
    fn test_loss_scaler_only_for_float16() {
        let mut amp = AmpConfig {
            enable: true,
            ..Default::default()
        };
        assert!(amp.uses_loss_scaler());
        amp.dtype = AmpDtype::Bfloat16;
        assert!(!amp.uses_loss_scaler());
        amp.dtype = AmpDtype::Float16;
        amp.level = AmpLevel::O0;
        assert!(!amp.is_active());
        assert!(!amp.uses_loss_scaler());
    }

    #[test]
    fn test_sharding_stage_parse() {
        assert_eq!(ShardingStage::parse("0").unwrap(), ShardingStage::Stage0);
        assert_eq!(ShardingStage::parse("stage2").unwrap(), ShardingStage::Stage2);
        assert!(ShardingStage::parse("3").unwrap().shards_parameters());
        assert!(ShardingStage::parse("9").is_err());
    }
}
