//! Gate non-linearity of the feed-forward block.
//!
//! The result stays in the widened matmul dtype; the gated feed-forward
//! multiplies it with the up projection before casting back to storage.

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// `x * sigmoid(x)`, evaluated after widening `input` for the matmul.
pub fn silu(input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
    policy.cast_for_matmul(input)?.silu()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn silu_matches_sigmoid_product() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-3.0f32, -1.0, 0.0, 0.5, 2.0], (5,), &device)?;
        let output = silu(&input, &PrecisionPolicy::from_parameter_dtype(DType::F32))?;

        let sigmoid = (input.neg()?.exp()? + 1.0)?.recip()?;
        let reference = input.mul(&sigmoid)?;
        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn half_inputs_are_promoted() -> Result<()> {
        let input = Tensor::from_slice(&[0.0f32, 2.0], (2,), &Device::Cpu)?.to_dtype(DType::F16)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let output = silu(&input, &policy)?;
        assert_eq!(output.dtype(), DType::F32);

        let values = output.to_vec1::<f32>()?;
        assert_eq!(values[0], 0.0);
        assert!((values[1] - 2.0 / (1.0 + (-2.0f32).exp())).abs() < 1e-3);
        Ok(())
    }
}
