//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `name` so the error identifies the offending tensor
//! alongside its dimensions. They return `candle_core::Result<()>` so call
//! sites can propagate errors without panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(name: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [batch, seq, actual_hidden] if *actual_hidden == hidden && *batch > 0 && *seq > 0 => {
            Ok(())
        }
        dims => Err(Error::Msg(format!(
            "{name}: expected (batch, seq, {hidden}) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Float dtypes accepted for parameters and activations.
pub const FLOAT_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn shape_errors_name_the_tensor() {
        let t = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let err = expect_shape("wq", &t, &[3, 2]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("wq"), "{msg}");
        assert!(msg.contains("[2, 3]"), "{msg}");
    }

    #[test]
    fn batch_seq_hidden_rejects_empty_axes() {
        let t = Tensor::zeros((1, 0, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(expect_batch_seq_hidden("h", &t, 4).is_err());
        let t = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(expect_batch_seq_hidden("h", &t, 4).is_ok());
    }

    #[test]
    fn dtype_allow_list() {
        let t = Tensor::zeros(2, DType::U32, &Device::Cpu).unwrap();
        assert!(expect_dtype_in("ids", &t, FLOAT_DTYPES).is_err());
        assert!(expect_dtype_in("ids", &t, &[DType::U32]).is_ok());
    }
}
