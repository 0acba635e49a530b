use candle_core::{DType, Device, Result, Tensor};
use embedding::token::TokenEmbedding;

fn table(vocab: usize, hidden: usize, dtype: DType) -> Result<TokenEmbedding> {
    let data = (0..vocab * hidden).map(|i| i as f32).collect::<Vec<_>>();
    let weight = Tensor::from_vec(data, (vocab, hidden), &Device::Cpu)?.to_dtype(dtype)?;
    TokenEmbedding::from_weight(weight)
}

#[test]
fn forward_shape_and_dtype_follow_table() -> Result<()> {
    let embedding = table(8, 4, DType::F16)?;
    let ids = Tensor::from_slice(&[0i64, 1, 2, 3], (2, 2), &Device::Cpu)?;
    let output = embedding.forward(&ids)?;
    assert_eq!(output.dims(), &[2, 2, 4]);
    assert_eq!(output.dtype(), DType::F16);
    Ok(())
}

#[test]
fn u32_ids_gather_the_right_rows() -> Result<()> {
    let embedding = table(5, 3, DType::F32)?;
    let ids = Tensor::from_slice(&[4u32, 1], (1, 2), &Device::Cpu)?;
    let rows = embedding.forward(&ids)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(rows, vec![12.0, 13.0, 14.0, 3.0, 4.0, 5.0]);
    Ok(())
}

#[test]
fn forward_rejects_out_of_range_ids() -> Result<()> {
    let embedding = table(4, 3, DType::F32)?;
    let ids = Tensor::from_slice(&[0i64, 4], (1, 2), &Device::Cpu)?;
    let err = embedding.forward(&ids).unwrap_err();
    assert!(err.to_string().contains("token id 4 exceeds vocab size"));

    let negative = Tensor::from_slice(&[-1i64], (1, 1), &Device::Cpu)?;
    assert!(embedding.forward(&negative).is_err());
    Ok(())
}

#[test]
fn rejects_float_ids_and_bad_rank() -> Result<()> {
    let embedding = table(4, 3, DType::F32)?;
    let floats = Tensor::zeros((1, 2), DType::F32, &Device::Cpu)?;
    assert!(embedding.forward(&floats).is_err());
    let flat = Tensor::from_slice(&[0u32, 1], (2,), &Device::Cpu)?;
    assert!(embedding.forward(&flat).is_err());
    Ok(())
}
