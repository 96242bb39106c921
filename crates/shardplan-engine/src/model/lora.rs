//! Low-rank adapter injection
//!
//! Wraps a model under a `model.` prefix and attaches `lora_A: [in, r]` and
//! `lora_B: [r, out]` to every linear layer whose path fully matches one of
//! the target regexes. Every other parameter is frozen.

use super::tensor::{Init, ParamTensor};
use super::tree::{join_path, split_param_path, Layer, LayerKind};
use regex::Regex;
use std::collections::HashSet;
use shardplan_types::{LoraConfig, Result, ShardplanError};
use tracing::{debug, info};

/// Name of the wrapper child holding the original model
pub const LORA_PREFIX: &str = "model";

/// Wrap `model` with adapters; `lazy` skips materializing the new factors
pub fn inject_lora(model: Layer, config: &LoraConfig, seed: u64, lazy: bool) -> Result<Layer> {
    if config.r == 0 {
        return Err(ShardplanError::config("LoRA rank must be positive"));
    }
    let targets = config
        .target_modules
        .iter()
        .map(|pattern| {
            Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                ShardplanError::config(format!("Invalid LoRA target '{}': {}", pattern, e))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut inner = model;
    inner.set_name(LORA_PREFIX);
    let mut adapted = 0;
    attach(&mut inner, "", config, &targets, seed, lazy, &mut adapted);

    let mut wrapped = Layer::container("").with_child(inner);
    let adapted_layers: HashSet<String> = wrapped
        .named_sublayers()
        .into_iter()
        .filter(|(_, layer)| layer.param("lora_A").is_some())
        .map(|(path, _)| path)
        .collect();
    wrapped.for_each_param_mut(&mut |path, param| {
        if let Some(source) = param.tied_to() {
            let source = join_path(LORA_PREFIX, source);
            param.retie(source);
        }
        param.trainable = match param.name() {
            "lora_A" | "lora_B" => true,
            "bias" => config.trainable_bias && adapted_layers.contains(split_param_path(path).0),
            _ => false,
        };
        Ok(())
    })?;

    info!(adapted, rank = config.r, "Injected LoRA adapters");
    Ok(wrapped)
}

fn attach(
    layer: &mut Layer,
    path: &str,
    config: &LoraConfig,
    targets: &[Regex],
    seed: u64,
    lazy: bool,
    adapted: &mut usize,
) {
    if let LayerKind::Linear {
        in_features,
        out_features,
    } = layer.kind()
    {
        if targets.iter().any(|t| t.is_match(path)) {
            let full = join_path(LORA_PREFIX, path);
            let bound = 1.0 / (in_features as f32).sqrt();
            let mut lora_a = ParamTensor::new("lora_A", vec![in_features, config.r], Init::Uniform(bound))
                .with_init_key(join_path(&full, "lora_A"));
            let mut lora_b = ParamTensor::new("lora_B", vec![config.r, out_features], Init::Zeros)
                .with_init_key(join_path(&full, "lora_B"));
            if !lazy {
                lora_a.initialize(seed);
                lora_b.initialize(seed);
            }
            layer.add_param(lora_a);
            layer.add_param(lora_b);
            *adapted += 1;
            debug!(path = %full, "Attached adapter");
        }
    }

    let names: Vec<String> = layer.children().iter().map(|c| c.name().to_string()).collect();
    for name in names {
        let child_path = join_path(path, &name);
        if let Some(child) = layer.child_mut(&name) {
            attach(child, &child_path, config, targets, seed, lazy, adapted);
        }
    }
}
