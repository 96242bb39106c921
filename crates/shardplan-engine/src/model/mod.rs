//! Model description: named layer tree, parameters and the reference
//! transformer with its adapter wrapper

pub mod llama;
pub mod lora;
pub mod tensor;
pub mod tree;

pub use llama::{build_llama, parallelize_config, ModelOptions};
pub use lora::inject_lora;
pub use tensor::{shard_bounds, slice_tensor, Init, ParamTensor};
pub use tree::{join_path, split_param_path, Layer, LayerKind};
