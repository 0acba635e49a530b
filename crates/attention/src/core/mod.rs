//! Core traits and types shared across attention kernels.
//!
//! Kernels take queries `[batch, heads, q_len, head_dim]`, keys already
//! transposed to `[batch, heads, head_dim, kv_len]` and values
//! `[batch, heads, kv_len, head_dim]`. Queries are the most recent `q_len`
//! positions of the key history, so query `i` sits at absolute position
//! `kv_len - q_len + i`.

pub mod config;
pub mod errors;

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

pub use config::{CausalMode, Config, KernelKind, ReducedPrecision};
pub use errors::AttentionError;

use crate::masks::{build_causal_mask, MASK_DTYPE};

/// Result of one attention call.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[batch, heads, q_len, head_dim]` in the dtype of `q`.
    pub output: Tensor,
    /// Scaled f32 scores before mask and softmax, `[batch, heads, q_len, kv_len]`.
    pub pre_softmax_scores: Tensor,
}

/// Unified interface for attention kernels.
///
/// * Masks, when present, are additive and must broadcast to
///   `[batch, heads, q_len, kv_len]`.
/// * With `causal`, keys later than a query's absolute position are dropped.
/// * Softmax runs in `f32`.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        causal: bool,
    ) -> Result<AttentionOutput, AttentionError>;
}

const SUPPORTED_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];

/// Dimensions shared by a validated `(q, k, v)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub batch: usize,
    pub heads: usize,
    pub q_len: usize,
    pub kv_len: usize,
    pub head_dim: usize,
}

pub(crate) fn validate_inputs(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
) -> Result<Geometry, AttentionError> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape("q, k, v must reside on the same device"));
    }

    let dtype = q.dtype();
    if !SUPPORTED_DTYPES.contains(&dtype) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::shape(format!(
            "q, k, v must share a dtype, got {:?}, {:?}, {:?}",
            dtype,
            k.dtype(),
            v.dtype()
        )));
    }

    let rank4 = |name: &str, layout: &str, t: &Tensor| {
        t.dims4().map_err(|_| {
            AttentionError::shape(format!("{name} must be [{layout}], got {:?}", t.dims()))
        })
    };
    let (batch, heads, q_len, head_dim) = rank4("q", "batch, heads, q_len, head_dim", q)?;
    let (kb, kh, kd, kv_len) = rank4("k", "batch, heads, head_dim, kv_len", k)?;
    let (vb, vh, vk, vd) = rank4("v", "batch, heads, kv_len, head_dim", v)?;

    if q_len == 0 || kv_len == 0 || head_dim == 0 {
        return Err(AttentionError::shape(format!(
            "empty attention: q_len={q_len} kv_len={kv_len} head_dim={head_dim}"
        )));
    }
    if (kb, kh, kd) != (batch, heads, head_dim) {
        return Err(AttentionError::shape(format!(
            "k shape mismatch: expected [{batch}, {heads}, {head_dim}, ?] got [{kb}, {kh}, {kd}, {kv_len}]"
        )));
    }
    if (vb, vh, vk, vd) != (batch, heads, kv_len, head_dim) {
        return Err(AttentionError::shape(format!(
            "v shape mismatch: expected [{batch}, {heads}, {kv_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
        )));
    }

    if let Some(mask) = mask {
        if !device.same_device(mask.device()) {
            return Err(AttentionError::shape("mask must reside on the same device as q"));
        }
        if mask.rank() > 4 || mask.broadcast_as((batch, heads, q_len, kv_len)).is_err() {
            return Err(AttentionError::shape(format!(
                "mask {:?} does not broadcast to [{batch}, {heads}, {q_len}, {kv_len}]",
                mask.dims()
            )));
        }
    }

    Ok(Geometry {
        batch,
        heads,
        q_len,
        kv_len,
        head_dim,
    })
}

/// Subtracts the mean key over the key-length axis. `keys` is `[b, h, kv_len, d]`.
pub(crate) fn smooth_keys(keys: &Tensor) -> Result<Tensor, AttentionError> {
    let mean = keys.mean_keepdim(2)?;
    Ok(keys.broadcast_sub(&mean)?)
}

/// Masks, softmaxes and applies f32 `scores` to `v`.
pub(crate) fn weighted_values(
    scores: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    causal: bool,
    geometry: Geometry,
    weights_dtype: DType,
    out_dtype: DType,
) -> Result<Tensor, AttentionError> {
    let mut logits = scores.clone();
    if let Some(mask) = mask {
        logits = logits.broadcast_add(&mask.to_dtype(MASK_DTYPE)?)?;
    }
    if causal {
        let causal_mask = build_causal_mask(scores.device(), geometry.q_len, geometry.kv_len)?;
        logits = logits.broadcast_add(&causal_mask)?;
    }

    let weights = softmax_last_dim(&logits.contiguous()?)?;
    let output = weights
        .to_dtype(weights_dtype)?
        .matmul(&v.to_dtype(weights_dtype)?.contiguous()?)?;
    Ok(output.to_dtype(out_dtype)?)
}

/// Builds the kernel selected by `config.kernel`.
pub fn kernel_for(config: &Config) -> Box<dyn Attention + Send + Sync> {
    match config.kernel {
        KernelKind::Int8 => Box::new(crate::quantized::QuantizedAttention::new(config.clone())),
        KernelKind::Exact => Box::new(crate::reference::ExactAttention::new(config.clone())),
    }
}
