//! Parallelization Planner
//!
//! Applies a [`ParallelizeConfig`] to a model tree on one rank:
//!
//! 1. Reports plan patterns that match nothing (`UnresolvedPath`, warning only)
//! 2. Assigns every layer to a pipeline stage from the split specification,
//!    pinning the global layer to the last stage
//! 3. Walks the tree depth-first with an explicit sequence-parallel
//!    accumulator and records each leaf's activation layout and collectives
//! 4. Resolves every parameter's placements and keeps only this rank's slice,
//!    dropping storage for parameters that live on other stages
//!
//! Activation placements are listed over the stage mesh axes for logical
//! `[batch, seq, hidden]` activations: batch is sharded over `dp`, and the
//! `mp` entry follows the rules below.

use super::pattern::PathPattern;
use super::plan::{ParallelizeConfig, PipelineConfig, PlanRule, SplitPoint, SplitSpec};
use super::resolver::PlacementResolver;
use crate::context::{MeshContext, DP_AXIS, MP_AXIS};
use crate::model::{shard_bounds, split_param_path, Layer, LayerKind};
use crate::pipeline::LayerDistribution;
use serde::{Deserialize, Serialize};
use shardplan_types::{Placement, Result, ShardingStage, ShardplanError};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

/// Sequence dimension of `[batch, seq, hidden]` activations
const SEQ_DIM: usize = 1;
/// Hidden dimension of `[batch, seq, hidden]` activations
const HIDDEN_DIM: usize = 2;

/// Communication inserted on the tensor-parallel axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collective {
    AllGather { dim: usize },
    AllReduce,
    ReduceScatter { dim: usize },
    /// Keep the local slice of a replicated tensor, no communication
    Split { dim: usize },
}

impl fmt::Display for Collective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collective::AllGather { dim } => write!(f, "all_gather(dim={})", dim),
            Collective::AllReduce => write!(f, "all_reduce"),
            Collective::ReduceScatter { dim } => write!(f, "reduce_scatter(dim={})", dim),
            Collective::Split { dim } => write!(f, "split(dim={})", dim),
        }
    }
}

/// Activation layout decided for one layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerPlan {
    pub stage: usize,
    /// Rules the plan declared for this path
    pub rules: Vec<PlanRule>,
    /// Sequence parallelism in effect while the layer runs
    pub sequence_parallel: bool,
    /// Placement the layer consumes, after input-side collectives
    pub input: Vec<Placement>,
    /// Placement the layer's computation produces (`Partial` for row-wise)
    pub local_output: Vec<Placement>,
    /// Placement handed downstream, after output-side collectives
    pub output: Vec<Placement>,
    pub collectives: Vec<Collective>,
}

/// Boundary where one stage's output becomes the next stage's input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSplitPoint {
    pub path: String,
    pub marker: SplitPoint,
    /// Stage starting at this boundary
    pub next_stage: usize,
}

/// A parameter tied to another one, possibly across stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedWeight {
    pub source: String,
    pub tied: String,
    pub source_stage: usize,
    pub tied_stage: usize,
}

/// Result of planning on one rank
#[derive(Debug, Clone)]
pub struct PlannedModel {
    /// Tree with rewritten placements and local shards
    pub root: Layer,
    /// Per-layer activation plans, keyed by path
    pub layers: BTreeMap<String, LayerPlan>,
    pub split_points: Vec<PipelineSplitPoint>,
    pub shared_weights: Vec<SharedWeight>,
    /// Plan patterns that matched nothing
    pub unresolved: Vec<String>,
    /// Pipeline stage of this rank
    pub stage: usize,
    pub num_stages: usize,
    /// Axes parameter placements refer to
    pub param_axes: Vec<(String, usize)>,
    pub sharding_stage: ShardingStage,
}

impl PlannedModel {
    /// Stage of the layer at `path`
    pub fn stage_of(&self, path: &str) -> Option<usize> {
        self.layers.get(path).map(|plan| plan.stage)
    }

    pub fn is_first_stage(&self) -> bool {
        self.stage == 0
    }

    pub fn is_last_stage(&self) -> bool {
        self.stage + 1 == self.num_stages
    }

    /// Paths of trainable parameters held by this rank, sorted
    pub fn local_trainable(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .root
            .named_parameters()
            .into_iter()
            .filter(|(_, p)| p.trainable && p.is_materialized())
            .map(|(path, _)| path)
            .collect();
        paths.sort();
        paths
    }

    /// Paths of every parameter held by this rank, sorted
    pub fn local_parameters(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .root
            .named_parameters()
            .into_iter()
            .filter(|(_, p)| p.is_materialized())
            .map(|(path, _)| path)
            .collect();
        paths.sort();
        paths
    }
}

/// Sequence-parallel flag threaded through the traversal
#[derive(Debug, Clone)]
struct SequenceParallelState {
    /// Set by `SequenceParallelBegin`, cleared for good by `SequenceParallelEnd`
    enabled: bool,
    ended: bool,
    /// Subtree overrides from `Enable`/`Disable`
    scopes: Vec<bool>,
    /// Tensor-parallel placement of the activation stream
    flow: Placement,
    /// Input shared by consecutive column-wise siblings (q/k/v, gate/up)
    branch_input: Option<Placement>,
}

impl SequenceParallelState {
    fn new() -> Self {
        Self {
            enabled: false,
            ended: false,
            scopes: Vec::new(),
            flow: Placement::Replicate,
            branch_input: None,
        }
    }

    fn effective(&self) -> bool {
        self.scopes.last().copied().unwrap_or(self.enabled)
    }
}

/// Append the collectives moving `from` to `to` on the tensor-parallel axis
fn convert(from: Placement, to: Placement, out: &mut Vec<Collective>) {
    match (from, to) {
        _ if from == to => {}
        (Placement::Partial, Placement::Replicate) => out.push(Collective::AllReduce),
        (Placement::Partial, Placement::Shard(dim)) => out.push(Collective::ReduceScatter { dim }),
        (Placement::Shard(dim), Placement::Replicate) => out.push(Collective::AllGather { dim }),
        (Placement::Replicate, Placement::Shard(dim)) => out.push(Collective::Split { dim }),
        (Placement::Shard(a), Placement::Shard(b)) => {
            out.push(Collective::AllGather { dim: a });
            out.push(Collective::Split { dim: b });
        }
        (Placement::Replicate, Placement::Replicate) | (_, Placement::Partial) => {}
    }
}

/// Plans a model against the rank's mesh context
pub struct Planner<'a> {
    context: &'a MeshContext,
}

impl<'a> Planner<'a> {
    pub fn new(context: &'a MeshContext) -> Self {
        Self { context }
    }

    /// Plan `model` and keep this rank's shards.
    ///
    /// Fatal: `ConflictingSplit`, `ShapeMismatch`, malformed split specs.
    /// Patterns matching nothing are logged and returned in `unresolved`.
    pub fn apply(&self, mut model: Layer, config: &ParallelizeConfig, seed: u64) -> Result<PlannedModel> {
        let mesh = self.context.mesh()?;
        let num_stages = self.context.num_stages()?;
        let stage = self.context.stage()?;
        let stage_mesh = self.context.stage_mesh(stage)?;
        let sharding_stage = config.sharding_stage();
        let resolver = PlacementResolver::new(&stage_mesh, config.mp_config.as_ref(), sharding_stage);
        let tensor_parallel = mesh.degree(MP_AXIS) > 1;

        let mut unresolved = self.unresolved_patterns(&model, config);

        let (layer_stages, split_points) =
            assign_stages(&model, config.pp_config.as_ref(), num_stages, &mut unresolved)?;

        let mut layers = BTreeMap::new();
        let mut state = SequenceParallelState::new();
        let context = WalkContext {
            resolver: &resolver,
            stages: &layer_stages,
            axes: resolver.axes(),
            tensor_parallel,
        };
        for child in model.children() {
            context.walk(child, child.name(), &mut state, &mut layers);
        }

        let assignments = self.assign_parameters(&model, &resolver, &layer_stages)?;
        let mut shared_weights = Vec::new();
        for (path, assignment) in &assignments {
            if let Some(source) = &assignment.tied_to {
                shared_weights.push(SharedWeight {
                    source: source.clone(),
                    tied: path.clone(),
                    source_stage: assignments.get(source).map(|a| a.stage).unwrap_or(0),
                    tied_stage: assignment.stage,
                });
            }
        }
        shared_weights.sort_by(|a, b| a.tied.cmp(&b.tied));

        model.for_each_param_mut(&mut |path, param| {
            let assignment = assignments.get(path).ok_or_else(|| {
                ShardplanError::internal(format!("no placement computed for '{}'", path))
            })?;
            param.assign(
                assignment.placements.clone(),
                assignment.stage,
                assignment.local_shape.clone(),
            );
            if assignment.stage == stage {
                param.materialize_slice(&assignment.bounds, seed)?;
            } else {
                param.release();
            }
            Ok(())
        })?;

        info!(
            rank = self.context.rank(),
            stage,
            num_stages,
            layers = layers.len(),
            split_points = split_points.len(),
            shared = shared_weights.len(),
            unresolved = unresolved.len(),
            "Planned model"
        );

        Ok(PlannedModel {
            root: model,
            layers,
            split_points,
            shared_weights,
            unresolved,
            stage,
            num_stages,
            param_axes: resolver.axes().to_vec(),
            sharding_stage,
        })
    }

    fn unresolved_patterns(&self, model: &Layer, config: &ParallelizeConfig) -> Vec<String> {
        let Some(plan) = &config.mp_config else {
            return Vec::new();
        };
        let mut paths: Vec<String> = model.named_sublayers().into_iter().map(|(p, _)| p).collect();
        paths.extend(model.named_parameters().into_iter().map(|(p, _)| p));

        let mut unresolved = Vec::new();
        for entry in plan.entries() {
            let pattern = PathPattern::compile(&entry.pattern);
            if !paths.iter().any(|p| pattern.matches(p)) {
                let err = ShardplanError::unresolved_path(&entry.pattern, entry.describe());
                warn!(error = %err, "Plan rule ignored");
                unresolved.push(entry.pattern.clone());
            }
        }
        unresolved
    }

    fn assign_parameters(
        &self,
        model: &Layer,
        resolver: &PlacementResolver,
        layer_stages: &HashMap<String, usize>,
    ) -> Result<BTreeMap<String, ParamAssignment>> {
        let coordinates = resolver
            .axes()
            .iter()
            .map(|(name, _)| self.context.coordinate(name))
            .collect::<Result<Vec<_>>>()?;

        let params = model.named_parameters();
        let mut assignments = BTreeMap::new();
        for (path, param) in params.iter().filter(|(_, p)| p.tied_to().is_none()) {
            let placements = resolver.resolve(path, param.global_shape())?;
            let (bounds, local_shape) = local_slice(param.global_shape(), &placements, resolver.axes(), &coordinates);
            let stage = layer_stages
                .get(split_param_path(path).0)
                .copied()
                .unwrap_or(0);
            debug!(path = %path, placements = ?placements, stage, "Resolved parameter");
            assignments.insert(
                path.clone(),
                ParamAssignment {
                    placements,
                    stage,
                    bounds,
                    local_shape,
                    tied_to: None,
                },
            );
        }

        for (path, param) in params.iter() {
            let Some(source) = param.tied_to() else {
                continue;
            };
            let source_param = model.find_param(source).ok_or_else(|| {
                ShardplanError::not_found(format!("'{}' is tied to missing parameter '{}'", path, source))
            })?;
            if source_param.global_shape() != param.global_shape() {
                return Err(ShardplanError::config(format!(
                    "'{}' has shape {:?} but its tie source '{}' has {:?}",
                    path,
                    param.global_shape(),
                    source,
                    source_param.global_shape()
                )));
            }
            let mut assignment = assignments
                .get(source)
                .cloned()
                .ok_or_else(|| ShardplanError::not_found(format!("tie source '{}' has no placement", source)))?;
            assignment.stage = layer_stages
                .get(split_param_path(path).0)
                .copied()
                .unwrap_or(0);
            assignment.tied_to = Some(source.to_string());
            debug!(path = %path, source, "Tied parameter follows its source placement");
            assignments.insert(path.clone(), assignment);
        }
        Ok(assignments)
    }
}

#[derive(Debug, Clone)]
struct ParamAssignment {
    placements: Vec<Placement>,
    stage: usize,
    bounds: Vec<(usize, usize)>,
    local_shape: Vec<usize>,
    tied_to: Option<String>,
}

/// Slice bounds and local shape of this rank's shard
fn local_slice(
    shape: &[usize],
    placements: &[Placement],
    axes: &[(String, usize)],
    coordinates: &[usize],
) -> (Vec<(usize, usize)>, Vec<usize>) {
    let mut bounds = Vec::with_capacity(shape.len());
    for (dim, size) in shape.iter().enumerate() {
        let splits: Vec<(usize, usize)> = placements
            .iter()
            .enumerate()
            .filter(|(_, p)| **p == Placement::Shard(dim))
            .map(|(axis, _)| (coordinates[axis], axes[axis].1))
            .collect();
        bounds.push(shard_bounds(*size, &splits));
    }
    let local_shape = bounds.iter().map(|(s, e)| e - s).collect();
    (bounds, local_shape)
}

/// Stage of every layer path plus the resolved split points
fn assign_stages(
    model: &Layer,
    pp_config: Option<&PipelineConfig>,
    num_stages: usize,
    unresolved: &mut Vec<String>,
) -> Result<(HashMap<String, usize>, Vec<PipelineSplitPoint>)> {
    let sublayers = model.named_sublayers();
    let leaves: Vec<&str> = sublayers
        .iter()
        .filter(|(_, layer)| layer.is_leaf())
        .map(|(path, _)| path.as_str())
        .collect();

    let under = |leaf: &str, path: &str| leaf == path || leaf.starts_with(&format!("{}.", path));

    let mut boundaries: Vec<(usize, String, SplitPoint)> = Vec::new();
    let mut global: Option<String> = None;

    if num_stages > 1 {
        let config = pp_config.ok_or_else(|| {
            ShardplanError::config(format!(
                "pipeline degree {} needs a split specification",
                num_stages
            ))
        })?;

        let points: Vec<(String, SplitPoint)> = match &config.split_spec {
            SplitSpec::Even(list_path) => {
                let list = model.find(list_path).ok_or_else(|| {
                    ShardplanError::config(format!("split path '{}' not found", list_path))
                })?;
                let distribution =
                    LayerDistribution::even_distribution(list.children().len(), num_stages);
                if !distribution.is_complete() {
                    return Err(ShardplanError::config(format!(
                        "cannot split {} blocks of '{}' into {} stages",
                        list.children().len(),
                        list_path,
                        num_stages
                    )));
                }
                distribution
                    .boundaries()
                    .into_iter()
                    .map(|i| (format!("{}.{}", list_path, list.children()[i].name()), SplitPoint::End))
                    .collect()
            }
            SplitSpec::Points(points) => points.clone(),
        };

        for (path, marker) in points {
            let covered: Vec<usize> = leaves
                .iter()
                .enumerate()
                .filter(|(_, leaf)| under(leaf, &path))
                .map(|(i, _)| i)
                .collect();
            let (Some(first), Some(last)) = (covered.first(), covered.last()) else {
                return Err(ShardplanError::config(format!(
                    "split point '{}' matches no layer",
                    path
                )));
            };
            let index = match marker {
                SplitPoint::Beginning => *first,
                SplitPoint::End => last + 1,
            };
            if index == 0 || index >= leaves.len() {
                return Err(ShardplanError::config(format!(
                    "split point '{}' ({:?}) leaves an empty stage",
                    path, marker
                )));
            }
            if let Some((_, other, other_marker)) = boundaries.iter().find(|(i, _, _)| *i == index) {
                return Err(ShardplanError::conflicting_split(
                    leaves[index],
                    format!("{}:{:?}", other, other_marker),
                    format!("{}:{:?}", path, marker),
                ));
            }
            boundaries.push((index, path, marker));
        }
        if boundaries.len() + 1 != num_stages {
            return Err(ShardplanError::config(format!(
                "{} split points for {} pipeline stages",
                boundaries.len(),
                num_stages
            )));
        }
        boundaries.sort_by_key(|(i, _, _)| *i);

        if let Some(global_path) = &config.global_spec {
            if model.find(global_path).is_some() {
                global = Some(global_path.clone());
            } else {
                let err = ShardplanError::unresolved_path(global_path, "global_spec");
                warn!(error = %err, "Global layer not found");
                unresolved.push(global_path.clone());
            }
        }
    }

    let mut leaf_stage: HashMap<&str, usize> = HashMap::new();
    for (i, leaf) in leaves.iter().enumerate() {
        let pinned = global.as_deref().map(|g| under(leaf, g)).unwrap_or(false);
        let stage = if pinned {
            num_stages - 1
        } else {
            boundaries.iter().filter(|(b, _, _)| *b <= i).count()
        };
        leaf_stage.insert(leaf, stage);
    }

    let mut stages = HashMap::with_capacity(sublayers.len() + 1);
    for (path, _) in &sublayers {
        let stage = leaves
            .iter()
            .find(|leaf| under(leaf, path))
            .and_then(|leaf| leaf_stage.get(leaf))
            .copied()
            .unwrap_or(0);
        stages.insert(path.clone(), stage);
    }
    stages.insert(String::new(), 0);

    let split_points = boundaries
        .iter()
        .enumerate()
        .map(|(i, (_, path, marker))| PipelineSplitPoint {
            path: path.clone(),
            marker: *marker,
            next_stage: i + 1,
        })
        .collect();
    Ok((stages, split_points))
}

struct WalkContext<'a> {
    resolver: &'a PlacementResolver,
    stages: &'a HashMap<String, usize>,
    axes: &'a [(String, usize)],
    tensor_parallel: bool,
}

impl<'a> WalkContext<'a> {
    fn placements(&self, flow: Placement) -> Vec<Placement> {
        self.axes
            .iter()
            .map(|(name, _)| match name.as_str() {
                DP_AXIS => Placement::Shard(0),
                MP_AXIS => flow,
                _ => Placement::Replicate,
            })
            .collect()
    }

    fn walk(
        &self,
        layer: &Layer,
        path: &str,
        state: &mut SequenceParallelState,
        out: &mut BTreeMap<String, LayerPlan>,
    ) {
        let rules: Vec<PlanRule> = self
            .resolver
            .plan()
            .lookup(path)
            .map(|entry| entry.rules.clone())
            .unwrap_or_default();
        let markers: Vec<PlanRule> = if self.tensor_parallel {
            rules.iter().copied().filter(PlanRule::is_sequence_marker).collect()
        } else {
            Vec::new()
        };
        let mut collectives = Vec::new();
        let mut scopes = 0;

        for marker in &markers {
            match marker {
                PlanRule::SequenceParallelEnd { .. } => {
                    convert(state.flow, Placement::Replicate, &mut collectives);
                    state.flow = Placement::Replicate;
                    state.enabled = false;
                    state.ended = true;
                }
                PlanRule::SequenceParallelEnable if !state.ended => {
                    state.scopes.push(true);
                    scopes += 1;
                }
                PlanRule::SequenceParallelDisable { .. } => {
                    state.scopes.push(false);
                    scopes += 1;
                }
                _ => {}
            }
        }
        let stage = self.stages.get(path).copied().unwrap_or(0);

        if layer.is_leaf() {
            let plan = self.plan_leaf(layer, path, stage, rules, collectives, scopes, state);
            out.insert(path.to_string(), plan);
        } else {
            let effective = state.effective();
            if self.tensor_parallel && scopes > 0 {
                let target = if effective {
                    Placement::Shard(SEQ_DIM)
                } else {
                    Placement::Replicate
                };
                convert(state.flow, target, &mut collectives);
                state.flow = target;
            }
            let input = self.placements(state.flow);
            state.branch_input = None;
            for child in layer.children() {
                let child_path = format!("{}.{}", path, child.name());
                self.walk(child, &child_path, state, out);
            }
            state.branch_input = None;
            let local_output = self.placements(state.flow);
            for _ in 0..scopes {
                state.scopes.pop();
            }
            if self.tensor_parallel && scopes > 0 && state.effective() {
                convert(state.flow, Placement::Shard(SEQ_DIM), &mut collectives);
                state.flow = Placement::Shard(SEQ_DIM);
            }
            if !rules.is_empty() {
                out.insert(
                    path.to_string(),
                    LayerPlan {
                        stage,
                        rules: rules.clone(),
                        sequence_parallel: effective,
                        input,
                        local_output,
                        output: self.placements(state.flow),
                        collectives: collectives.clone(),
                    },
                );
            }
        }

        if markers
            .iter()
            .any(|m| matches!(m, PlanRule::SequenceParallelBegin { .. }))
            && !state.ended
        {
            let mut post = Vec::new();
            convert(state.flow, Placement::Shard(SEQ_DIM), &mut post);
            state.flow = Placement::Shard(SEQ_DIM);
            state.enabled = true;
            if let Some(plan) = out.get_mut(path) {
                plan.collectives.extend(post);
                plan.output = self.placements(state.flow);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_leaf(
        &self,
        layer: &Layer,
        path: &str,
        stage: usize,
        rules: Vec<PlanRule>,
        mut collectives: Vec<Collective>,
        scoped: usize,
        state: &mut SequenceParallelState,
    ) -> LayerPlan {
        let effective = self.tensor_parallel && state.effective();
        let rule = self.resolver.activation_rule(path);

        // Consecutive column-wise siblings read the same input
        let incoming = match (rule, state.branch_input) {
            (Some(PlanRule::ColWiseParallel { .. }), Some(shared)) => shared,
            _ => state.flow,
        };
        let incoming = if matches!(layer.kind(), LayerKind::Embedding { .. }) {
            Placement::Replicate
        } else {
            incoming
        };

        let (input, local_output, output) = match rule {
            Some(PlanRule::ColWiseParallel { gather_output }) => {
                convert(incoming, Placement::Replicate, &mut collectives);
                let local = Placement::Shard(HIDDEN_DIM);
                let output = if gather_output {
                    convert(local, Placement::Replicate, &mut collectives);
                    Placement::Replicate
                } else {
                    local
                };
                (Placement::Replicate, local, output)
            }
            Some(PlanRule::RowWiseParallel { .. }) => {
                convert(incoming, Placement::Shard(HIDDEN_DIM), &mut collectives);
                let output = if effective {
                    Placement::Shard(SEQ_DIM)
                } else {
                    Placement::Replicate
                };
                convert(Placement::Partial, output, &mut collectives);
                (Placement::Shard(HIDDEN_DIM), Placement::Partial, output)
            }
            _ => {
                let target = if effective {
                    Placement::Shard(SEQ_DIM)
                } else {
                    Placement::Replicate
                };
                if self.tensor_parallel {
                    convert(incoming, target, &mut collectives);
                }
                (target, target, target)
            }
        };

        state.branch_input = match rule {
            Some(PlanRule::ColWiseParallel { .. }) => Some(incoming),
            _ => None,
        };
        state.flow = output;

        // Leaf-scoped enable/disable ends with the leaf
        for _ in 0..scoped {
            state.scopes.pop();
        }
        if scoped > 0 && state.effective() && state.flow != Placement::Shard(SEQ_DIM) {
            convert(state.flow, Placement::Shard(SEQ_DIM), &mut collectives);
            state.flow = Placement::Shard(SEQ_DIM);
        }

        LayerPlan {
            stage,
            rules,
            sequence_parallel: effective,
            input: self.placements(input),
            local_output: self.placements(local_output),
            output: self.placements(state.flow),
            collectives,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::llama::{build_llama, tensor_parallel_plan, ModelOptions};
    use crate::parallel::plan::{DataParallelConfig, ParallelizePlan};
    use shardplan_types::{LlamaConfig, ParallelConfig};

    fn context(rank: usize, dp: usize, pp: usize, mp: usize) -> MeshContext {
        MeshContext::from_parallel_config(
            rank,
            &ParallelConfig {
                dp,
                pp,
                mp,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn model(layers: usize) -> Layer {
        let config = LlamaConfig {
            num_hidden_layers: layers,
            ..LlamaConfig::tiny()
        };
        build_llama(
            &config,
            ModelOptions {
                share_embedding: false,
                position_embedding: false,
                lazy_init: false,
                seed: 3,
            },
        )
    }

    #[test]
    fn test_local_slice_column_shard() {
        let axes = vec![("dp".to_string(), 2), ("mp".to_string(), 2)];
        let (bounds, shape) = local_slice(
            &[16, 64],
            &[Placement::Replicate, Placement::Shard(1)],
            &axes,
            &[1, 1],
        );
        assert_eq!(bounds, vec![(0, 16), (32, 64)]);
        assert_eq!(shape, vec![16, 32]);
    }

    #[test]
    fn test_unresolved_pattern_is_not_fatal() {
        let ctx = context(0, 1, 1, 2);
        let plan = tensor_parallel_plan().rule("llama.layers.*.cross_attn", PlanRule::col_wise());
        let config = ParallelizeConfig {
            mp_config: Some(plan),
            ..Default::default()
        };
        let planned = Planner::new(&ctx).apply(model(2), &config, 3).unwrap();
        assert!(planned.unresolved.contains(&"llama.layers.*.cross_attn".to_string()));
        // adapter rules match nothing on a model without adapters
        assert!(planned
            .unresolved
            .contains(&"llama.layers.*.self_attn.q_proj.lora_B".to_string()));
    }

    #[test]
    fn test_even_split_and_global_pin() {
        let ctx = context(0, 1, 2, 1);
        let config = ParallelizeConfig {
            pp_config: Some(crate::model::llama::pipeline_config("")),
            ..Default::default()
        };
        let planned = Planner::new(&ctx).apply(model(3), &config, 3).unwrap();
        assert_eq!(planned.split_points.len(), 1);
        assert_eq!(planned.split_points[0].path, "llama.layers.1");
        assert_eq!(planned.stage_of("llama.embed_tokens"), Some(0));
        assert_eq!(planned.stage_of("llama.layers.1.mlp.down_proj"), Some(0));
        assert_eq!(planned.stage_of("llama.layers.2.input_layernorm"), Some(1));
        assert_eq!(planned.stage_of("llama.global_layer"), Some(1));
        assert_eq!(planned.stage_of("lm_head"), Some(1));

        let head = planned.root.find_param("lm_head.weight").unwrap();
        assert_eq!(head.stage(), 1);
        assert!(!head.is_materialized());
        assert!(planned.root.find_param("llama.embed_tokens.weight").unwrap().is_materialized());
    }

    #[test]
    fn test_conflicting_split_points() {
        let ctx = context(0, 1, 3, 1);
        let config = ParallelizeConfig {
            pp_config: Some(PipelineConfig {
                split_spec: SplitSpec::Points(vec![
                    ("llama.layers.0".to_string(), SplitPoint::End),
                    ("llama.layers.1".to_string(), SplitPoint::Beginning),
                ]),
                global_spec: None,
            }),
            ..Default::default()
        };
        let err = Planner::new(&ctx).apply(model(3), &config, 3).unwrap_err();
        match err {
            ShardplanError::ConflictingSplit { path, .. } => {
                assert_eq!(path, "llama.layers.1.input_layernorm")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_pipeline_without_spec_fails() {
        let ctx = context(0, 1, 2, 1);
        let err = Planner::new(&ctx)
            .apply(model(2), &ParallelizeConfig::default(), 3)
            .unwrap_err();
        assert!(matches!(err, ShardplanError::Config { .. }));
    }

    #[test]
    fn test_row_wise_output_is_partial_until_reduced() {
        let ctx = context(0, 1, 1, 2);
        let config = ParallelizeConfig {
            mp_config: Some(
                ParallelizePlan::new()
                    .rule("llama.layers.*.mlp.up_proj", PlanRule::col_wise())
                    .rule("llama.layers.*.mlp.down_proj", PlanRule::row_wise()),
            ),
            ..Default::default()
        };
        let planned = Planner::new(&ctx).apply(model(1), &config, 3).unwrap();
        let down = &planned.layers["llama.layers.0.mlp.down_proj"];
        // axes are [dp, mp]; batch stays sharded on dp
        assert_eq!(down.input, vec![Placement::Shard(0), Placement::Shard(2)]);
        assert_eq!(down.local_output, vec![Placement::Shard(0), Placement::Partial]);
        assert_eq!(down.output, vec![Placement::Shard(0), Placement::Replicate]);
        assert_eq!(down.collectives, vec![Collective::AllReduce]);
    }

    #[test]
    fn test_stage3_materializes_dp_slice() {
        let ctx = context(1, 2, 1, 1);
        let config = ParallelizeConfig {
            dp_config: Some(DataParallelConfig {
                sharding_level: ShardingStage::Stage3,
            }),
            ..Default::default()
        };
        let planned = Planner::new(&ctx).apply(model(1), &config, 3).unwrap();
        let embed = planned.root.find_param("llama.embed_tokens.weight").unwrap();
        assert_eq!(embed.placements(), &[Placement::Shard(0)]);
        assert_eq!(embed.local_shape(), &[32, 16]);
        assert_eq!(embed.data().unwrap().len(), 32 * 16);
    }

    #[test]
    fn test_convert_collectives() {
        let mut out = Vec::new();
        convert(Placement::Replicate, Placement::Replicate, &mut out);
        convert(Placement::Shard(1), Placement::Shard(1), &mut out);
        convert(Placement::Replicate, Placement::Partial, &mut out);
        assert!(out.is_empty());

        convert(Placement::Shard(2), Placement::Shard(1), &mut out);
        assert_eq!(
            out,
            vec![Collective::AllGather { dim: 2 }, Collective::Split { dim: 1 }]
        );
        out.clear();
        convert(Placement::Partial, Placement::Shard(1), &mut out);
        assert_eq!(out, vec![Collective::ReduceScatter { dim: 1 }]);
    }

    #[test]
    fn test_enable_after_end_stays_off() {
        let ctx = context(0, 1, 1, 2);
        let config = ParallelizeConfig {
            mp_config: Some(
                ParallelizePlan::new()
                    .rule("llama.embed_tokens", PlanRule::sequence_parallel_begin())
                    .rule("llama.global_layer", PlanRule::sequence_parallel_end())
                    .rule("llama.layers.*.input_layernorm", PlanRule::SequenceParallelEnable),
            ),
            ..Default::default()
        };
        let planned = Planner::new(&ctx).apply(model(2), &config, 3).unwrap();

        let global = &planned.layers["llama.global_layer"];
        assert_eq!(global.collectives, vec![Collective::AllGather { dim: 1 }]);
        for layer in 0..2 {
            let norm = &planned.layers[&format!("llama.layers.{}.input_layernorm", layer)];
            assert!(!norm.sequence_parallel);
            assert_eq!(norm.output, vec![Placement::Shard(0), Placement::Replicate]);
            assert!(norm.collectives.is_empty());
        }
        assert!(!planned.layers["lm_head"].sequence_parallel);
    }
}
