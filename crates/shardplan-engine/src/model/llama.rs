//! Reference decoder-only transformer tree and its parallelization presets

use super::tensor::{Init, ParamTensor};
use super::tree::{join_path, Layer, LayerKind};
use crate::parallel::{
    DataParallelConfig, ParallelizeConfig, ParallelizePlan, PipelineConfig, PlanRule, SplitSpec,
};
use shardplan_types::{LlamaConfig, TrainingConfig};

/// Path of the repeated decoder blocks
pub const LAYERS_PATH: &str = "llama.layers";
/// Path of the parameterless layer pinned to the last stage
pub const GLOBAL_LAYER_PATH: &str = "llama.global_layer";
/// Path of the token embedding weight
pub const EMBEDDING_WEIGHT_PATH: &str = "llama.embed_tokens.weight";

/// Model construction switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelOptions {
    /// Tie `lm_head.weight` to the token embedding
    pub share_embedding: bool,
    pub position_embedding: bool,
    /// Build parameters without storage
    pub lazy_init: bool,
    pub seed: u64,
}

impl ModelOptions {
    pub fn from_training(config: &TrainingConfig) -> Self {
        Self {
            share_embedding: config.share_embedding,
            position_embedding: config.position_embedding,
            lazy_init: config.use_lazy_init,
            seed: config.seed,
        }
    }
}

struct Builder {
    options: ModelOptions,
}

impl Builder {
    fn param(&self, layer_path: &str, name: &str, shape: Vec<usize>, init: Init) -> ParamTensor {
        let mut param =
            ParamTensor::new(name, shape, init).with_init_key(join_path(layer_path, name));
        if !self.options.lazy_init {
            param.initialize(self.options.seed);
        }
        param
    }

    fn linear(&self, parent: &str, name: &str, input: usize, output: usize, bias: bool) -> Layer {
        let path = join_path(parent, name);
        let bound = 1.0 / (input as f32).sqrt();
        let mut layer = Layer::new(
            name,
            LayerKind::Linear {
                in_features: input,
                out_features: output,
            },
        )
        .with_param(self.param(&path, "weight", vec![input, output], Init::Uniform(bound)));
        if bias {
            layer.add_param(self.param(&path, "bias", vec![output], Init::Zeros));
        }
        layer
    }

    fn embedding(&self, parent: &str, name: &str, rows: usize, dim: usize) -> Layer {
        let path = join_path(parent, name);
        Layer::new(
            name,
            LayerKind::Embedding {
                num_embeddings: rows,
                embedding_dim: dim,
            },
        )
        .with_param(self.param(&path, "weight", vec![rows, dim], Init::Uniform(0.02)))
    }

    fn norm(&self, parent: &str, name: &str, dim: usize) -> Layer {
        let path = join_path(parent, name);
        Layer::new(name, LayerKind::RmsNorm { dim })
            .with_param(self.param(&path, "weight", vec![dim], Init::Ones))
    }

    fn decoder_layer(&self, index: usize, config: &LlamaConfig) -> Layer {
        let path = join_path(LAYERS_PATH, &index.to_string());
        let (h, i) = (config.hidden_size, config.intermediate_size);

        let attn_path = join_path(&path, "self_attn");
        let self_attn = Layer::container("self_attn")
            .with_child(self.linear(&attn_path, "q_proj", h, h, true))
            .with_child(self.linear(&attn_path, "k_proj", h, h, true))
            .with_child(self.linear(&attn_path, "v_proj", h, h, true))
            .with_child(self.linear(&attn_path, "o_proj", h, h, false));

        let mlp_path = join_path(&path, "mlp");
        let mlp = Layer::container("mlp")
            .with_child(self.linear(&mlp_path, "gate_proj", h, i, false))
            .with_child(self.linear(&mlp_path, "up_proj", h, i, false))
            .with_child(self.linear(&mlp_path, "down_proj", i, h, false));

        Layer::container(index.to_string())
            .with_child(self.norm(&path, "input_layernorm", h))
            .with_child(self_attn)
            .with_child(self.norm(&path, "post_attention_layernorm", h))
            .with_child(mlp)
    }
}

/// Build the model tree.
///
/// Layout: `llama.embed_tokens`, optional `llama.position_embedding`,
/// `llama.global_layer`, `llama.layers.{i}`, `llama.norm`, then `lm_head`.
/// Linear weights are `[in, out]`; `lm_head.weight` is `[hidden, vocab]`, or
/// a `[vocab, hidden]` copy tied to the embedding when sharing is enabled.
pub fn build_llama(config: &LlamaConfig, options: ModelOptions) -> Layer {
    let builder = Builder { options };
    let (h, v) = (config.hidden_size, config.vocab_size);

    let mut llama = Layer::container("llama").with_child(builder.embedding("llama", "embed_tokens", v, h));
    if options.position_embedding {
        llama.add_child(builder.embedding("llama", "position_embedding", config.seq_length, h));
    }
    llama.add_child(Layer::new("global_layer", LayerKind::Global));

    let mut layers = Layer::new("layers", LayerKind::LayerList);
    for index in 0..config.num_hidden_layers {
        layers.add_child(builder.decoder_layer(index, config));
    }
    llama.add_child(layers);
    llama.add_child(builder.norm("llama", "norm", h));

    let lm_head = if options.share_embedding {
        // Same init key as the embedding, so both copies start identical
        let weight = builder
            .param("llama.embed_tokens", "weight", vec![v, h], Init::Uniform(0.02))
            .tied(EMBEDDING_WEIGHT_PATH);
        Layer::new(
            "lm_head",
            LayerKind::Linear {
                in_features: h,
                out_features: v,
            },
        )
        .with_param(weight)
    } else {
        builder.linear("", "lm_head", h, v, false)
    };

    Layer::container("").with_child(llama).with_child(lm_head)
}

/// Tensor-parallel plan: attention projections gather their outputs,
/// adapter factors carry explicit rules
pub fn tensor_parallel_plan() -> ParallelizePlan {
    let gather = PlanRule::ColWiseParallel {
        gather_output: true,
    };
    ParallelizePlan::new()
        .rule("llama.embed_tokens", gather)
        .rule("llama.position_embedding", PlanRule::col_wise())
        .rule("llama.layers.*.self_attn.q_proj", gather)
        .rule("llama.layers.*.self_attn.q_proj.lora_B", PlanRule::col_wise())
        .rule("llama.layers.*.self_attn.k_proj", gather)
        .rule("llama.layers.*.self_attn.k_proj.lora_B", PlanRule::col_wise())
        .rule("llama.layers.*.self_attn.v_proj", gather)
        .rule("llama.layers.*.self_attn.v_proj.lora_B", PlanRule::col_wise())
        .rule(
            "llama.layers.*.self_attn.o_proj",
            PlanRule::RowWiseParallel {
                is_input_parallel: false,
            },
        )
        .rule("llama.layers.*.self_attn.o_proj.lora_A", PlanRule::row_wise())
        .rule("llama.layers.*.mlp.gate_proj", PlanRule::col_wise())
        .rule("llama.layers.*.mlp.gate_proj.lora_B", PlanRule::col_wise())
        .rule("llama.layers.*.mlp.up_proj", PlanRule::col_wise())
        .rule("llama.layers.*.mlp.up_proj.lora_B", PlanRule::col_wise())
        .rule("llama.layers.*.mlp.down_proj", PlanRule::row_wise())
        .rule("llama.layers.*.mlp.down_proj.lora_A", PlanRule::row_wise())
        .rule("lm_head.weight", PlanRule::col_wise())
}

fn split_projections(plan: ParallelizePlan) -> ParallelizePlan {
    plan.rule("llama.layers.*.self_attn.q_proj", PlanRule::col_wise())
        .rule("llama.layers.*.self_attn.k_proj", PlanRule::col_wise())
        .rule("llama.layers.*.self_attn.v_proj", PlanRule::col_wise())
        .rule("llama.layers.*.self_attn.o_proj", PlanRule::row_wise())
}

/// Sequence-parallel plan: begin after the embeddings, run attention and
/// MLP on the full sequence, end before the output head
pub fn sequence_parallel_plan() -> ParallelizePlan {
    let plan = ParallelizePlan::new()
        .rules(
            "llama.embed_tokens",
            vec![PlanRule::col_wise(), PlanRule::sequence_parallel_begin()],
        )
        .rules(
            "llama.position_embedding",
            vec![PlanRule::col_wise(), PlanRule::sequence_parallel_begin()],
        );
    split_projections(plan)
        .rule("llama.layers.*.self_attn", PlanRule::sequence_parallel_disable())
        .rule("llama.layers.*.mlp.gate_proj", PlanRule::col_wise())
        .rule("llama.layers.*.mlp.up_proj", PlanRule::col_wise())
        .rule("llama.layers.*.mlp.down_proj", PlanRule::row_wise())
        .rule(
            "llama.layers.*.mlp",
            PlanRule::SequenceParallelDisable {
                need_transpose: false,
            },
        )
        .rule("lm_head.weight", PlanRule::col_wise())
        .rule("lm_head", PlanRule::sequence_parallel_end())
}

/// Sequence-parallel plan driven by per-norm enable markers
pub fn prepare_input_output_plan() -> ParallelizePlan {
    let plan = ParallelizePlan::new()
        .rule("llama.embed_tokens", PlanRule::col_wise())
        .rule("llama.position_embedding", PlanRule::col_wise());
    split_projections(plan)
        .rule("llama.layers.*.mlp.gate_proj", PlanRule::col_wise())
        .rule("llama.layers.*.mlp.up_proj", PlanRule::col_wise())
        .rule("llama.layers.*.mlp.down_proj", PlanRule::row_wise())
        .rule("lm_head.weight", PlanRule::col_wise())
        .rule("llama.layers.*.input_layernorm", PlanRule::SequenceParallelEnable)
        .rule(
            "llama.layers.*.post_attention_layernorm",
            PlanRule::SequenceParallelEnable,
        )
        .rule("llama.norm", PlanRule::SequenceParallelEnable)
}

/// Even split of the decoder blocks with the global layer on the last stage
pub fn pipeline_config(prefix: &str) -> PipelineConfig {
    PipelineConfig {
        split_spec: SplitSpec::Even(format!("{}{}", prefix, LAYERS_PATH)),
        global_spec: Some(format!("{}{}", prefix, GLOBAL_LAYER_PATH)),
    }
}

/// Parallelization request for a run, following its degrees and switches.
/// Patterns get a `model.` prefix when adapters wrap the model.
pub fn parallelize_config(config: &TrainingConfig) -> ParallelizeConfig {
    let prefix = if config.enable_lora { "model." } else { "" };
    let parallel = &config.parallel;

    let mp_config = (parallel.mp > 1).then(|| {
        let plan = if !parallel.sequence_parallel {
            tensor_parallel_plan()
        } else if parallel.prepare_input_output {
            prepare_input_output_plan()
        } else {
            sequence_parallel_plan()
        };
        plan.with_prefix(prefix)
    });

    ParallelizeConfig {
        dp_config: (parallel.dp > 1).then_some(DataParallelConfig {
            sharding_level: parallel.sharding_stage,
        }),
        mp_config,
        pp_config: (parallel.pp > 1).then(|| pipeline_config(prefix)),
    }
}
