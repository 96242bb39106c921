//! CLI command implementations

pub mod plan;
pub mod train;

pub use plan::PlanCommand;
pub use train::TrainCommand;

use clap::Args;
use shardplan_types::{AmpDtype, AmpLevel, LlamaConfig, Result, ShardingStage, TrainingConfig};

/// Run settings shared by every command; each flag overrides the loaded config
#[derive(Args, Debug, Clone, Default)]
pub struct RunOverrides {
    /// Data-parallel degree
    #[arg(long)]
    pub dp: Option<usize>,

    /// Tensor-parallel degree
    #[arg(long)]
    pub mp: Option<usize>,

    /// Pipeline-parallel degree
    #[arg(long)]
    pub pp: Option<usize>,

    /// Gradient accumulation steps
    #[arg(long)]
    pub acc_step: Option<usize>,

    /// Sharding stage (0-3)
    #[arg(long)]
    pub sharding_stage: Option<String>,

    /// Shard activations along the sequence between tensor-parallel regions
    #[arg(long)]
    pub sequence_parallel: bool,

    /// Sequence parallelism through per-norm enable markers
    #[arg(long)]
    pub prepare_input_output: bool,

    /// Number of decoder layers
    #[arg(long)]
    pub num_hidden_layers: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Inject LoRA adapters and freeze base weights
    #[arg(long)]
    pub lora: bool,

    /// Tie the output head to the token embedding
    #[arg(long)]
    pub share_embedding: bool,

    #[arg(long)]
    pub position_embedding: bool,

    /// Build parameters without storage and materialize local shards only
    #[arg(long)]
    pub lazy_init: bool,

    /// Enable mixed precision
    #[arg(long)]
    pub amp: bool,

    /// Mixed precision dtype (float16 or bfloat16)
    #[arg(long)]
    pub amp_dtype: Option<String>,

    /// Mixed precision level (O0, O1 or O2)
    #[arg(long)]
    pub amp_level: Option<String>,

    /// Use the small test-sized model
    #[arg(long)]
    pub tiny: bool,
}

impl RunOverrides {
    /// Apply every flag that was given to `config`, then validate it
    pub fn apply(&self, config: &mut TrainingConfig) -> Result<()> {
        if self.tiny {
            let layers = config.model.num_hidden_layers;
            config.model = LlamaConfig {
                num_hidden_layers: layers,
                ..LlamaConfig::tiny()
            };
        }
        if let Some(dp) = self.dp {
            config.parallel.dp = dp;
        }
        if let Some(mp) = self.mp {
            config.parallel.mp = mp;
        }
        if let Some(pp) = self.pp {
            config.parallel.pp = pp;
        }
        if let Some(acc_step) = self.acc_step {
            config.acc_step = acc_step;
        }
        if let Some(stage) = &self.sharding_stage {
            config.parallel.sharding_stage = ShardingStage::parse(stage)?;
        }
        if self.prepare_input_output {
            config.parallel.prepare_input_output = true;
            config.parallel.sequence_parallel = true;
        }
        if self.sequence_parallel {
            config.parallel.sequence_parallel = true;
        }
        if let Some(layers) = self.num_hidden_layers {
            config.model.num_hidden_layers = layers;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.enable_lora |= self.lora;
        config.share_embedding |= self.share_embedding;
        config.position_embedding |= self.position_embedding;
        config.use_lazy_init |= self.lazy_init;
        config.amp.enable |= self.amp;
        if let Some(dtype) = self.amp_dtype.as_deref().and_then(AmpDtype::parse) {
            config.amp.dtype = dtype;
        }
        if let Some(level) = self.amp_level.as_deref().and_then(AmpLevel::parse) {
            config.amp.level = level;
        }
        config.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_loaded_values() {
        let mut config = TrainingConfig {
            acc_step: 2,
            ..Default::default()
        };
        let overrides = RunOverrides {
            dp: Some(2),
            mp: Some(2),
            sharding_stage: Some("stage2".to_string()),
            prepare_input_output: true,
            tiny: true,
            amp_dtype: Some("bfloat16".to_string()),
            ..Default::default()
        };
        overrides.apply(&mut config).unwrap();

        assert_eq!(config.parallel.dp, 2);
        assert_eq!(config.parallel.mp, 2);
        assert_eq!(config.acc_step, 2);
        assert_eq!(config.parallel.sharding_stage, ShardingStage::Stage2);
        assert!(config.parallel.sequence_parallel);
        assert_eq!(config.model.hidden_size, 16);
        assert_eq!(config.amp.dtype, AmpDtype::Bfloat16);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut config = TrainingConfig::default();
        let overrides = RunOverrides {
            dp: Some(0),
            ..Default::default()
        };
        assert!(overrides.apply(&mut config).is_err());

        let overrides = RunOverrides {
            sharding_stage: Some("stage9".to_string()),
            ..Default::default()
        };
        assert!(overrides.apply(&mut TrainingConfig::default()).is_err());
    }
}
