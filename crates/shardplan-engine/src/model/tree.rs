//! Named layer tree
//!
//! Paths are dotted names from the root, e.g. `llama.layers.0.self_attn.q_proj`;
//! a parameter path appends the parameter name (`...q_proj.weight`). The root
//! itself has an empty name and contributes nothing to paths.

use super::tensor::ParamTensor;
use serde::{Deserialize, Serialize};
use shardplan_types::Result;

/// Structural role of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    /// Groups named children
    Container,
    /// Repeated blocks named `0`, `1`, ...
    LayerList,
    /// `y = x W + b` with `W: [in_features, out_features]`
    Linear {
        in_features: usize,
        out_features: usize,
    },
    /// Lookup table `[num_embeddings, embedding_dim]`
    Embedding {
        num_embeddings: usize,
        embedding_dim: usize,
    },
    RmsNorm { dim: usize },
    /// Parameterless layer that needs every stage's output
    Global,
}

/// A node of the model tree
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    name: String,
    kind: LayerKind,
    params: Vec<ParamTensor>,
    children: Vec<Layer>,
}

/// Join a parent path and a child name
pub fn join_path(prefix: &str, name: &str) -> String {
    match (prefix.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{}.{}", prefix, name),
    }
}

impl Layer {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn container(name: impl Into<String>) -> Self {
        Self::new(name, LayerKind::Container)
    }

    pub fn with_param(mut self, param: ParamTensor) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_child(mut self, child: Layer) -> Self {
        self.children.push(child);
        self
    }

    pub fn add_param(&mut self, param: ParamTensor) {
        self.params.push(param);
    }

    pub fn add_child(&mut self, child: Layer) {
        self.children.push(child);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn params(&self) -> &[ParamTensor] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [ParamTensor] {
        &mut self.params
    }

    pub fn children(&self) -> &[Layer] {
        &self.children
    }

    /// A layer without sublayers
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn child(&self, name: &str) -> Option<&Layer> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn param(&self, name: &str) -> Option<&ParamTensor> {
        self.params.iter().find(|p| p.name() == name)
    }

    pub fn param_mut(&mut self, name: &str) -> Option<&mut ParamTensor> {
        self.params.iter_mut().find(|p| p.name() == name)
    }

    /// Layer at a dotted path relative to this one; `""` is this layer
    pub fn find(&self, path: &str) -> Option<&Layer> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.')
            .try_fold(self, |layer, segment| layer.child(segment))
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Layer> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.')
            .try_fold(self, |layer, segment| layer.child_mut(segment))
    }

    /// Parameter at a dotted path such as `lm_head.weight`
    pub fn find_param(&self, path: &str) -> Option<&ParamTensor> {
        let (layer, name) = split_param_path(path);
        self.find(layer)?.param(name)
    }

    pub fn find_param_mut(&mut self, path: &str) -> Option<&mut ParamTensor> {
        let (layer, name) = split_param_path(path);
        self.find_mut(layer)?.param_mut(name)
    }

    /// Every descendant layer with its path, depth-first pre-order
    pub fn named_sublayers(&self) -> Vec<(String, &Layer)> {
        let mut out = Vec::new();
        for child in &self.children {
            child.collect_layers(&child.name, &mut out);
        }
        out
    }

    fn collect_layers<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Layer)>) {
        out.push((path.to_string(), self));
        for child in &self.children {
            child.collect_layers(&join_path(path, &child.name), out);
        }
    }

    /// Every parameter with its full path, in traversal order
    pub fn named_parameters(&self) -> Vec<(String, &ParamTensor)> {
        let mut out = Vec::new();
        self.collect_params("", &mut out);
        out
    }

    fn collect_params<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a ParamTensor)>) {
        for param in &self.params {
            out.push((join_path(path, param.name()), param));
        }
        for child in &self.children {
            child.collect_params(&join_path(path, &child.name), out);
        }
    }

    /// Visit every parameter mutably with its full path
    pub fn for_each_param_mut<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(&str, &mut ParamTensor) -> Result<()>,
    {
        self.visit_params_mut("", f)
    }

    fn visit_params_mut<F>(&mut self, path: &str, f: &mut F) -> Result<()>
    where
        F: FnMut(&str, &mut ParamTensor) -> Result<()>,
    {
        for param in &mut self.params {
            let param_path = join_path(path, param.name());
            f(&param_path, param)?;
        }
        for child in &mut self.children {
            let child_path = join_path(path, &child.name);
            child.visit_params_mut(&child_path, f)?;
        }
        Ok(())
    }

    /// Number of parameter elements in the full (unsharded) model
    pub fn global_numel(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, p)| p.global_numel())
            .sum()
    }
}

/// Split `a.b.weight` into `("a.b", "weight")`
pub fn split_param_path(path: &str) -> (&str, &str) {
    match path.rfind('.') {
        Some(index) => (&path[..index], &path[index + 1..]),
        None => ("", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tensor::Init;

    fn small_tree() -> Layer {
        let linear = Layer::new(
            "proj",
            LayerKind::Linear {
                in_features: 2,
                out_features: 3,
            },
        )
        .with_param(ParamTensor::new("weight", vec![2, 3], Init::Ones));
        Layer::container("").with_child(Layer::container("block").with_child(linear))
    }

    #[test]
    fn test_named_sublayers_preorder() {
        let tree = small_tree();
        let names: Vec<String> = tree.named_sublayers().into_iter().map(|(p, _)| p).collect();
        assert_eq!(names, vec!["block", "block.proj"]);
    }

    #[test]
    fn test_find_param() {
        let mut tree = small_tree();
        assert_eq!(
            tree.find_param("block.proj.weight").unwrap().global_shape(),
            &[2, 3]
        );
        assert!(tree.find_param("block.proj.bias").is_none());
        tree.find_param_mut("block.proj.weight").unwrap().trainable = false;
        assert!(!tree.named_parameters()[0].1.trainable);
    }

    #[test]
    fn test_split_param_path() {
        assert_eq!(split_param_path("lm_head.weight"), ("lm_head", "weight"));
        assert_eq!(split_param_path("weight"), ("", "weight"));
    }
}
