//! Per-layer, per-head entropy summaries of the attention distribution.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::softmax_last_dim;

use crate::error::ModelError;

const MIN_PROB: f32 = 1e-10;

/// Entropy and varentropy (in bits) of each layer's last-position attention,
/// stored as `[batch, layers, heads]` f32 tensors.
#[derive(Debug, Clone)]
pub struct AttnStats {
    entropy: Tensor,
    varentropy: Tensor,
}

impl AttnStats {
    pub fn new(
        batch: usize,
        n_layers: usize,
        n_heads: usize,
        device: &Device,
    ) -> Result<Self, ModelError> {
        let shape = (batch, n_layers, n_heads);
        Ok(Self {
            entropy: Tensor::zeros(shape, DType::F32, device)?,
            varentropy: Tensor::zeros(shape, DType::F32, device)?,
        })
    }

    /// Records layer `layer` from its pre-softmax scores `[batch, heads, kv_len]`.
    pub fn update(&mut self, scores: &Tensor, layer: usize) -> Result<(), ModelError> {
        let (batch, n_layers, n_heads) = self.entropy.dims3()?;
        if layer >= n_layers {
            return Err(ModelError::config(format!(
                "stats layer {layer} out of range for {n_layers} layers"
            )));
        }
        match scores.dims() {
            [b, h, kv] if *b == batch && *h == n_heads && *kv > 0 => {}
            dims => {
                return Err(ModelError::config(format!(
                    "stats expected scores [{batch}, {n_heads}, kv_len], got {dims:?}"
                )))
            }
        }

        let probs = softmax_last_dim(&scores.to_dtype(DType::F32)?.contiguous()?)?;
        let log2_probs = probs
            .clamp(MIN_PROB, 1f32)?
            .log()?
            .affine(1.0 / std::f64::consts::LN_2, 0.0)?;
        let entropy = (&probs * &log2_probs)?.sum_keepdim(D::Minus1)?.neg()?;
        let deviation = log2_probs.broadcast_add(&entropy)?.sqr()?;
        let varentropy = (&probs * &deviation)?.sum_keepdim(D::Minus1)?;

        // [batch, heads, 1] -> [batch, 1, heads]
        let entropy = entropy.transpose(1, 2)?.contiguous()?;
        let varentropy = varentropy.transpose(1, 2)?.contiguous()?;
        self.entropy.slice_set(&entropy, 1, layer)?;
        self.varentropy.slice_set(&varentropy, 1, layer)?;
        Ok(())
    }

    /// `[batch, layers, heads]`
    pub fn entropy(&self) -> &Tensor {
        &self.entropy
    }

    /// `[batch, layers, heads]`
    pub fn varentropy(&self) -> &Tensor {
        &self.varentropy
    }

    /// Mean entropy over layers and heads, `[batch]`.
    pub fn avg_entropy(&self) -> Result<Tensor, ModelError> {
        Ok(self.entropy.mean(D::Minus1)?.mean(D::Minus1)?)
    }

    /// Mean varentropy over layers and heads, `[batch]`.
    pub fn avg_varentropy(&self) -> Result<Tensor, ModelError> {
        Ok(self.varentropy.mean(D::Minus1)?.mean(D::Minus1)?)
    }
}
