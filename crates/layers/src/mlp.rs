//! Gated position-wise feed-forward block.
//!
//! Hidden states `(batch, seq, hidden)` are projected to `intermediate_size`
//! twice: once through the gate (`w1`) which is passed through SiLU,
//! once through the up projection (`w3`). The element-wise product is
//! contracted back to `hidden` by the down projection (`w2`):
//! `w2(silu(w1 x) ⊙ w3 x)`.

use candle_core::{Result, Tensor};

use crate::{activations, checks, dtypes::PrecisionPolicy, linear::{Linear, LinearLayer}};

/// Static shape of a feed-forward block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
        }
    }
}

/// SwiGLU-style feed-forward with bias-free projections.
#[derive(Debug, Clone)]
pub struct GatedFeedForward {
    config: FeedForwardConfig,
    gate: Linear,
    up: Linear,
    down: Linear,
}

impl GatedFeedForward {
    /// Assembles the block from its gate (`w1`), up (`w3`) and down (`w2`) projections.
    pub fn new(config: FeedForwardConfig, gate: Linear, up: Linear, down: Linear) -> Result<Self> {
        let expected_in = [config.intermediate_size, config.hidden_size];
        checks::expect_shape("ffn.w1", gate.weight(), &expected_in)?;
        checks::expect_shape("ffn.w3", up.weight(), &expected_in)?;
        checks::expect_shape(
            "ffn.w2",
            down.weight(),
            &[config.hidden_size, config.intermediate_size],
        )?;
        Ok(Self {
            config,
            gate,
            up,
            down,
        })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("ffn.input", hidden, self.config.hidden_size)?;

        let gated = activations::silu(&self.gate.forward(hidden, policy)?, policy)?;
        let up = policy.cast_for_matmul(&self.up.forward(hidden, policy)?)?;
        let mixed = policy.cast_to_storage(&gated.mul(&up)?)?;
        self.down.forward(&mixed, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::LinearConfig;
    use candle_core::{DType, Device};
    use rand::{rngs::StdRng, SeedableRng};

    fn projection(rng: &mut StdRng, input_dim: usize, output_dim: usize) -> Result<Linear> {
        let config = LinearConfig::new(input_dim, output_dim);
        Linear::new(config, config.xavier_uniform(rng, &Device::Cpu, DType::F32)?)
    }

    fn build(hidden: usize, inner: usize, seed: u64) -> Result<GatedFeedForward> {
        let mut rng = StdRng::seed_from_u64(seed);
        let gate = projection(&mut rng, hidden, inner)?;
        let up = projection(&mut rng, hidden, inner)?;
        let down = projection(&mut rng, inner, hidden)?;
        GatedFeedForward::new(FeedForwardConfig::new(hidden, inner), gate, up, down)
    }

    #[test]
    fn matches_manual_swiglu() -> Result<()> {
        let ffn = build(6, 10, 11)?;
        let input = Tensor::randn(0f32, 1.0, (2, 3, 6), &Device::Cpu)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let out = ffn.forward(&input, &policy)?;
        assert_eq!(out.dims(), &[2, 3, 6]);

        let flat = input.reshape((6, 6))?;
        let g = flat.matmul(&ffn.gate.weight().t()?)?.silu()?;
        let u = flat.matmul(&ffn.up.weight().t()?)?;
        let reference = g.mul(&u)?.matmul(&ffn.down.weight().t()?)?.reshape((2, 3, 6))?;
        let diff = out.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5, "diff {diff}");
        Ok(())
    }

    #[test]
    fn rejects_mismatched_projection_shapes() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let gate = projection(&mut rng, 4, 8)?;
        let up = projection(&mut rng, 4, 7)?;
        let down = projection(&mut rng, 8, 4)?;
        assert!(GatedFeedForward::new(FeedForwardConfig::new(4, 8), gate, up, down).is_err());
        Ok(())
    }
}
