//! Mixed-precision helpers

use crate::model::Layer;
use half::{bf16, f16};
use shardplan_types::{AmpConfig, DataType, Result};
use tracing::debug;

/// Gradient storage dtype, `None` when gradients stay fp32
pub fn gradient_dtype(config: &AmpConfig) -> Option<DataType> {
    (config.is_active() && !config.master_grad).then(|| config.dtype.data_type())
}

/// Round values through `dtype`; out-of-range float16 values become infinite
pub fn round_through(values: &mut [f32], dtype: DataType) {
    match dtype {
        DataType::FP32 => {}
        DataType::FP16 => values
            .iter_mut()
            .for_each(|v| *v = f16::from_f32(*v).to_f32()),
        DataType::BF16 => values
            .iter_mut()
            .for_each(|v| *v = bf16::from_f32(*v).to_f32()),
    }
}

/// Record each parameter's compute dtype; norm parameters stay fp32
pub fn decorate(model: &mut Layer, config: &AmpConfig) -> Result<()> {
    let mut reduced = 0usize;
    model.for_each_param_mut(&mut |path, param| {
        let dtype = config.parameter_dtype(path.contains("norm"));
        if dtype != DataType::FP32 {
            reduced += 1;
        }
        param.set_dtype(dtype);
        Ok(())
    })?;
    debug!(reduced, level = ?config.level, "Decorated parameters");
    Ok(())
}
