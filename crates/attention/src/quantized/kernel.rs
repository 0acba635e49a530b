//! Attention with int8 query/key scores.
//!
//! Keys are optionally smoothed, then queries and keys are quantized per row
//! along `head_dim` (one row per query position and one per key position).
//! Scores are integer dot products dequantized by `q_scale * k_scale` and
//! divided by `sqrt(head_dim)`. Softmax runs in f32 and the weighted value
//! sum in [`Config::weights_dtype`].

use std::sync::OnceLock;

use candle_core::{DType, Tensor};

use super::int8::{dot_i8, Int8Rows};
use crate::core::{
    smooth_keys, validate_inputs, weighted_values, Attention, AttentionError, AttentionOutput,
    Config, Geometry,
};

#[derive(Debug)]
pub struct QuantizedAttention {
    config: Config,
    first_call: OnceLock<()>,
}

impl QuantizedAttention {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            first_call: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Scaled int8 scores shaped `[batch, heads, q_len, kv_len]`.
    ///
    /// `keys` is `[batch, heads, kv_len, head_dim]` (already smoothed).
    fn scores(
        &self,
        q: &Tensor,
        keys: &Tensor,
        geometry: Geometry,
    ) -> Result<Tensor, AttentionError> {
        let q_rows = Int8Rows::from_tensor(q)?;
        let k_rows = Int8Rows::from_tensor(keys)?;

        let Geometry {
            batch,
            heads,
            q_len,
            kv_len,
            head_dim,
        } = geometry;
        let inv_sqrt_d = 1.0 / (head_dim as f32).sqrt();

        // Rows are grouped per (batch, head): q_len query rows, kv_len key rows.
        let q_rows: Vec<_> = q_rows.iter().collect();
        let k_rows: Vec<_> = k_rows.iter().collect();
        let mut scores = Vec::with_capacity(batch * heads * q_len * kv_len);
        for (q_head, k_head) in q_rows.chunks_exact(q_len).zip(k_rows.chunks_exact(kv_len)) {
            for &(q_row, q_scale) in q_head {
                for &(k_row, k_scale) in k_head {
                    let dot = dot_i8(q_row, k_row) as f32;
                    scores.push(dot * (q_scale * k_scale) * inv_sqrt_d);
                }
            }
        }

        Ok(Tensor::from_vec(
            scores,
            (batch, heads, q_len, kv_len),
            q.device(),
        )?)
    }
}

impl Attention for QuantizedAttention {
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
                "attention::quantized init smooth_keys={} weights_dtype={:?} causal={:?}",
                self.config.smooth_keys,
                self.config.weights_dtype,
                self.config.causal
            );
        }

        let geometry = validate_inputs(q, k, v, mask)?;

        let mut keys = k.to_dtype(DType::F32)?.transpose(2, 3)?.contiguous()?;
        if self.config.smooth_keys {
            keys = smooth_keys(&keys)?;
        }

        let pre_softmax_scores = self.scores(q, &keys, geometry)?;
        let output = weighted_values(
            &pre_softmax_scores,
            v,
            mask,
            causal,
            geometry,
            self.config.weights_dtype.dtype(),
            q.dtype(),
        )?;

        Ok(AttentionOutput {
            output,
            pre_softmax_scores,
        })
    }
}
