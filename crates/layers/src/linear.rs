//! Bias-free dense projections.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` (or `(rows,
//! in_dim)`) and return the same leading layout with `out_dim` features. The
//! weight is stored `[out_dim, in_dim]` as in the checkpoints this decoder
//! consumes, so the forward pass computes `x · Wᵀ`. Activations and weights
//! are widened by [`PrecisionPolicy::cast_for_matmul`] and the result is
//! cast back to storage.

use candle_core::{DType, Device, Error, Result, Tensor};
use rand::Rng;

use crate::{checks, dtypes::PrecisionPolicy};

/// Static shape of a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Outgoing feature dimension.
    pub output_dim: usize,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
        }
    }

    /// Samples a Xavier/Glorot uniform `[out_dim, in_dim]` weight from `rng`.
    pub fn xavier_uniform<R: Rng>(
        &self,
        rng: &mut R,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let bound = (6.0 / (self.input_dim + self.output_dim) as f64).sqrt();
        let data: Vec<f32> = (0..self.input_dim * self.output_dim)
            .map(|_| rng.gen_range(-bound..bound) as f32)
            .collect();
        Tensor::from_vec(data, (self.output_dim, self.input_dim), device)?.to_dtype(dtype)
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    /// Returns the static configuration used to validate inputs.
    fn config(&self) -> &LinearConfig;

    /// Applies the projection, widening half-precision inputs for the matmul.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Dense projection without bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
}

impl Linear {
    /// Wraps an existing `[out_dim, in_dim]` weight.
    pub fn new(config: LinearConfig, weight: Tensor) -> Result<Self> {
        checks::expect_shape(
            "linear.weight",
            &weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", &weight, checks::FLOAT_DTYPES)?;
        Ok(Self { config, weight })
    }

    /// Builds a projection whose config is inferred from the weight shape.
    pub fn from_weight(weight: Tensor) -> Result<Self> {
        let (output_dim, input_dim) = weight.dims2()?;
        Self::new(LinearConfig::new(input_dim, output_dim), weight)
    }

    /// Returns the underlying `[out_dim, in_dim]` weight.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [_, _, hidden_dim] | [_, hidden_dim] if *hidden_dim == self.config.input_dim => Ok(()),
            dims => Err(Error::Msg(format!(
                "linear expects input shaped [B, T, {}] or [T, {}], got {:?}",
                self.config.input_dim, self.config.input_dim, dims
            ))),
        }
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;

        let output = match *input.dims() {
            [batch, seq, _] => {
                let flat = input.reshape((batch * seq, self.config.input_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((batch, seq, self.config.output_dim))?
            }
            _ => input.matmul(&weight_t)?,
        };

        policy.cast_to_storage(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn reference_linear(input: &Tensor, weight: &Tensor) -> Result<Tensor> {
        let (batch, seq, hidden) = input.dims3()?;
        input
            .reshape((batch * seq, hidden))?
            .matmul(&weight.t()?)?
            .reshape((batch, seq, weight.dims()[0]))
    }

    #[test]
    fn forward_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 12);
        let mut rng = StdRng::seed_from_u64(7);
        let weight = config.xavier_uniform(&mut rng, &device, DType::F32)?;
        let input = Tensor::randn(0f32, 1.0, (2, 5, config.input_dim), &device)?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let linear = Linear::new(config, weight.to_dtype(dtype)?)?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = linear.forward(&input.to_dtype(dtype)?, &policy)?;

            assert_eq!(output.dims(), &[2, 5, config.output_dim]);
            assert_eq!(output.dtype(), dtype);

            let reference = reference_linear(&input, &weight)?;
            let max = output
                .to_dtype(DType::F32)?
                .sub(&reference)?
                .abs()?
                .max_all()?
                .to_vec0::<f32>()?;
            let tol = match dtype {
                DType::F16 => 2e-2,
                DType::BF16 => 6e-2,
                _ => 1e-4,
            };
            assert!(max <= tol, "max diff {} for {:?}", max, dtype);
        }
        Ok(())
    }

    #[test]
    fn xavier_samples_are_seeded_and_bounded() -> Result<()> {
        let config = LinearConfig::new(16, 8);
        let sample = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            config.xavier_uniform(&mut rng, &Device::Cpu, DType::F32)
        };
        let a = sample(3)?;
        let b = sample(3)?;
        assert_eq!(a.dims(), &[8, 16]);
        assert_eq!(a.sub(&b)?.abs()?.max_all()?.to_vec0::<f32>()?, 0.0);

        let bound = (6.0f32 / 24.0).sqrt();
        let max = a.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max < bound, "{max} >= {bound}");
        assert!(sample(4)?.sub(&a)?.abs()?.max_all()?.to_vec0::<f32>()? > 0.0);
        Ok(())
    }

    #[test]
    fn rejects_weights_that_do_not_match_the_config() {
        let weight = Tensor::zeros((4, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(Linear::new(LinearConfig::new(4, 8), weight.clone()).is_err());
        assert!(Linear::new(LinearConfig::new(8, 4), weight).is_ok());
        let flat = Tensor::zeros(32, DType::F32, &Device::Cpu).unwrap();
        assert!(Linear::new(LinearConfig::new(8, 4), flat).is_err());
    }

    #[test]
    fn rejects_wrong_input_width() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((3, 4), DType::F32, &device).unwrap();
        let linear = Linear::from_weight(weight).unwrap();
        let input = Tensor::zeros((1, 2, 5), DType::F32, &device).unwrap();
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        assert!(linear.forward(&input, &policy).is_err());
    }
}
