//! Root-mean-square normalisation used before attention and feed-forward.
//!
//! Inputs follow the `(batch, seq, hidden)` convention. Statistics are reduced
//! after [`PrecisionPolicy::cast_for_reduction`] along the last axis, the learned scale is
//! applied in the widened dtype, and the result is cast back to storage.

use candle_core::{Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Default stabiliser added to the mean square before the square root.
pub const DEFAULT_RMS_EPS: f64 = 1e-6;

/// Configuration shared by normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser applied to the mean square.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration with the decoder's default epsilon.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: DEFAULT_RMS_EPS,
        }
    }
}

/// Shared interface for normalisation layers used inside decoder blocks.
pub trait NormalizationLayer: Send + Sync {
    /// Returns the configuration so callers can check shape compatibility.
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a hidden state tensor.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// `weight ⊙ x / sqrt(mean(x²) + eps)`.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    config: NormConfig,
    weight: Tensor,
}

impl RmsNorm {
    /// Constructs an RMSNorm with a learned per-channel scale.
    pub fn new(weight: Tensor, config: NormConfig) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_dtype_in("norm.weight", &weight, checks::FLOAT_DTYPES)?;
        Ok(Self { config, weight })
    }

    /// Returns the learned scale.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl NormalizationLayer for RmsNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let compute = policy.cast_for_reduction(hidden)?;
        let mean_square = compute.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = (mean_square + self.config.epsilon)?.sqrt()?;
        let normalized = compute.broadcast_div(&denom)?;
        let normalized = policy.cast_for_matmul(&normalized)?;

        let weight = self.weight.to_dtype(normalized.dtype())?;
        policy.cast_to_storage(&normalized.broadcast_mul(&weight)?)
    }
}
