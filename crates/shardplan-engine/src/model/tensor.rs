//! Parameter tensors and shard slicing
//!
//! A [`ParamTensor`] carries its global shape, the shape of the slice this
//! rank holds and, when materialized, the local data. Values are a pure
//! function of the run seed and the tensor's init key, so a lazily created
//! tensor materializes exactly the slice an eager one would have kept.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use shardplan_types::{DataType, Placement, Result, ShardplanError};

/// Initializer for parameter values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Init {
    /// Uniform in `[-bound, bound)`
    Uniform(f32),
    Zeros,
    Ones,
}

impl Init {
    /// Generate `numel` values for the tensor identified by `key`
    pub fn values(&self, key: &str, seed: u64, numel: usize) -> Vec<f32> {
        match *self {
            Init::Zeros => vec![0.0; numel],
            Init::Ones => vec![1.0; numel],
            Init::Uniform(bound) if bound > 0.0 => {
                let mut rng = StdRng::seed_from_u64(seed ^ fnv1a(key));
                (0..numel).map(|_| rng.gen_range(-bound..bound)).collect()
            }
            Init::Uniform(_) => vec![0.0; numel],
        }
    }
}

fn fnv1a(key: &str) -> u64 {
    key.bytes().fold(0xcbf29ce484222325u64, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x100000001b3)
    })
}

/// One named parameter of a layer
#[derive(Debug, Clone, PartialEq)]
pub struct ParamTensor {
    name: String,
    init_key: String,
    init: Init,
    global_shape: Vec<usize>,
    local_shape: Vec<usize>,
    data: Option<Vec<f32>>,
    /// Accumulated gradient for the local data
    pub grad: Option<Vec<f32>>,
    placements: Vec<Placement>,
    /// Independent of placement; frozen parameters receive no gradient
    pub trainable: bool,
    stage: usize,
    dtype: DataType,
    tied_to: Option<String>,
}

impl ParamTensor {
    /// Create an unmaterialized parameter
    pub fn new(name: impl Into<String>, shape: Vec<usize>, init: Init) -> Self {
        let name = name.into();
        Self {
            init_key: name.clone(),
            name,
            init,
            local_shape: shape.clone(),
            global_shape: shape,
            data: None,
            grad: None,
            placements: Vec::new(),
            trainable: true,
            stage: 0,
            dtype: DataType::FP32,
            tied_to: None,
        }
    }

    /// Key the initial values are derived from
    pub fn with_init_key(mut self, key: impl Into<String>) -> Self {
        self.init_key = key.into();
        self
    }

    /// Mark this parameter as sharing storage semantics with `source`
    pub fn tied(mut self, source: impl Into<String>) -> Self {
        self.tied_to = Some(source.into());
        self
    }

    /// Fill the full global tensor immediately
    pub fn initialize(&mut self, seed: u64) {
        self.data = Some(self.init.values(&self.init_key, seed, self.global_numel()));
        self.local_shape = self.global_shape.clone();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init_key(&self) -> &str {
        &self.init_key
    }

    pub fn global_shape(&self) -> &[usize] {
        &self.global_shape
    }

    pub fn local_shape(&self) -> &[usize] {
        &self.local_shape
    }

    pub fn global_numel(&self) -> usize {
        self.global_shape.iter().product()
    }

    pub fn local_numel(&self) -> usize {
        self.local_shape.iter().product()
    }

    pub fn data(&self) -> Option<&[f32]> {
        self.data.as_deref()
    }

    pub fn data_mut(&mut self) -> Option<&mut Vec<f32>> {
        self.data.as_mut()
    }

    pub fn is_materialized(&self) -> bool {
        self.data.is_some()
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn set_dtype(&mut self, dtype: DataType) {
        self.dtype = dtype;
    }

    pub fn tied_to(&self) -> Option<&str> {
        self.tied_to.as_deref()
    }

    /// Repoint the tie after the source was moved in the tree
    pub fn retie(&mut self, source: impl Into<String>) {
        self.tied_to = Some(source.into());
    }

    /// Bias or norm parameters are excluded from weight decay
    pub fn is_decay_exempt(&self, path: &str) -> bool {
        self.name == "bias" || path.contains("norm")
    }

    /// Record placement and stage without touching storage
    pub fn assign(&mut self, placements: Vec<Placement>, stage: usize, local_shape: Vec<usize>) {
        self.placements = placements;
        self.stage = stage;
        self.local_shape = local_shape;
    }

    /// Keep only `bounds` of the global tensor, initializing first if lazy
    pub fn materialize_slice(&mut self, bounds: &[(usize, usize)], seed: u64) -> Result<()> {
        let full = match self.data.take() {
            Some(data) if data.len() == self.global_numel() => data,
            Some(data) => {
                return Err(ShardplanError::internal(format!(
                    "parameter '{}' already holds a {}-element shard",
                    self.init_key,
                    data.len()
                )))
            }
            None => self.init.values(&self.init_key, seed, self.global_numel()),
        };
        self.data = Some(slice_tensor(&full, &self.global_shape, bounds)?);
        Ok(())
    }

    /// Drop local storage (parameter lives on another stage)
    pub fn release(&mut self) {
        self.data = None;
        self.grad = None;
    }

    /// Replace local data with values of the same length
    pub fn set_data(&mut self, data: Vec<f32>) -> Result<()> {
        if data.len() != self.local_numel() {
            return Err(ShardplanError::internal(format!(
                "parameter '{}' expects {} local values, got {}",
                self.init_key,
                self.local_numel(),
                data.len()
            )));
        }
        self.data = Some(data);
        Ok(())
    }
}

/// Bounds of one shard of a dimension split hierarchically.
///
/// `splits` lists `(index, parts)` from the outermost split to the innermost;
/// each level divides the range chosen by the previous one.
pub fn shard_bounds(size: usize, splits: &[(usize, usize)]) -> (usize, usize) {
    let (mut start, mut len) = (0, size);
    for &(index, parts) in splits {
        len /= parts;
        start += index * len;
    }
    (start, start + len)
}

/// Copy the hyper-rectangle `bounds` out of a row-major tensor
pub fn slice_tensor(data: &[f32], shape: &[usize], bounds: &[(usize, usize)]) -> Result<Vec<f32>> {
    if bounds.len() != shape.len() || data.len() != shape.iter().product::<usize>() {
        return Err(ShardplanError::internal(format!(
            "cannot slice tensor of shape {:?} with bounds {:?}",
            shape, bounds
        )));
    }
    if bounds
        .iter()
        .zip(shape)
        .any(|((start, end), size)| start > end || end > size)
    {
        return Err(ShardplanError::internal(format!(
            "slice bounds {:?} exceed shape {:?}",
            bounds, shape
        )));
    }

    let numel = bounds.iter().map(|(s, e)| e - s).product();
    let mut out = Vec::with_capacity(numel);
    if numel == 0 {
        return Ok(out);
    }
    copy_slice(data, shape, bounds, 0, 0, &mut out);
    Ok(out)
}

fn copy_slice(
    data: &[f32],
    shape: &[usize],
    bounds: &[(usize, usize)],
    dim: usize,
    offset: usize,
    out: &mut Vec<f32>,
) {
    let stride: usize = shape[dim + 1..].iter().product();
    let (start, end) = bounds[dim];
    if dim + 1 == shape.len() {
        out.extend_from_slice(&data[offset + start..offset + end]);
        return;
    }
    for i in start..end {
        copy_slice(data, shape, bounds, dim + 1, offset + i * stride, out);
    }
}
