//! Which dtype each phase of a layer runs in.
//!
//! Parameters and activations live in the model's storage dtype. Half
//! precision (`f16`, `bf16`) is widened to `f32` for projections and RMS
//! statistics; `f32` and `f64` already run natively.

use candle_core::{DType, Result, Tensor};

/// Storage dtype plus the wider dtype used for matmuls and reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    wide: DType,
}

impl PrecisionPolicy {
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let wide = match storage {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self { storage, wide }
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.wide)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.wide)
    }

    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.storage)
    }
}

fn cast(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
