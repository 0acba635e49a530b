//! Exact f32 attention.
//!
//! Same contract as the int8 kernel without quantization: scores are
//! `q · k / sqrt(head_dim)` in f32, and the weighted value sum also runs in
//! f32. Used to bound the error of the quantized path.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};

use crate::core::{
    smooth_keys, validate_inputs, weighted_values, Attention, AttentionError, AttentionOutput,
    Config,
};

#[derive(Debug)]
pub struct ExactAttention {
    config: Config,
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            first_call: OnceLock::new(),
        }
    }
}

impl Default for ExactAttention {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        causal: bool,
    ) -> Result<AttentionOutput, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init smooth_keys={} causal={:?}",
                self.config.smooth_keys,
                self.config.causal
            );
        }

        let geometry = validate_inputs(q, k, v, mask)?;

        let mut keys = k.to_dtype(DType::F32)?.transpose(2, 3)?.contiguous()?;
        if self.config.smooth_keys {
            keys = smooth_keys(&keys)?;
        }

        let scale = 1.0 / (geometry.head_dim as f64).sqrt();
        let pre_softmax_scores = q
            .to_dtype(DType::F32)?
            .contiguous()?
            .matmul(&keys.transpose(2, 3)?.contiguous()?)?
            .affine(scale, 0.0)?;

        let output = weighted_values(
            &pre_softmax_scores,
            v,
            mask,
            causal,
            geometry,
            DType::F32,
            q.dtype(),
        )?;

        Ok(AttentionOutput {
            output,
            pre_softmax_scores,
        })
    }
}
