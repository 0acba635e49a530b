use anyhow::Result;
use attention::masks::padding_mask_from_lengths;
use attention::quantized::Int8Rows;
use attention::{
    Attention, AttentionError, Config, ExactAttention, QuantizedAttention, ReducedPrecision,
};
use candle_core::{DType, Device, Tensor, D};

fn no_smoothing() -> Config {
    Config {
        smooth_keys: false,
        ..Config::default()
    }
}

fn seq_tensor(shape: (usize, usize, usize, usize), seed: f32) -> Result<Tensor> {
    let count = shape.0 * shape.1 * shape.2 * shape.3;
    let data = (0..count)
        .map(|i| ((i as f32) * 0.618 + seed).sin())
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?)
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a
        .to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?)
}

#[test]
fn single_key_returns_its_value() -> Result<()> {
    let device = Device::Cpu;
    let q = Tensor::from_vec(vec![0.3f32, -1.0, 0.5, 2.0], (1, 1, 1, 4), &device)?;
    let k = Tensor::from_vec(vec![1.0f32, 0.25, -0.5, 0.75], (1, 1, 4, 1), &device)?;
    let v = Tensor::from_vec(vec![4.0f32, -3.0, 2.0, 1.0], (1, 1, 1, 4), &device)?;
    let kernel = QuantizedAttention::new(no_smoothing());

    let out = kernel.attend(&q, &k, &v, None, true)?;
    assert_eq!(out.output.dims(), &[1, 1, 1, 4]);
    assert_eq!(out.output.dtype(), DType::F32);
    assert_eq!(
        out.output.flatten_all()?.to_vec1::<f32>()?,
        vec![4.0, -3.0, 2.0, 1.0]
    );
    assert_eq!(out.pre_softmax_scores.dims(), &[1, 1, 1, 1]);
    Ok(())
}

#[test]
fn pre_softmax_scores_follow_the_int8_formula() -> Result<()> {
    let (b, h, q_len, kv_len, d) = (1, 2, 3, 5, 8);
    let q = seq_tensor((b, h, q_len, d), 0.1)?;
    let k_rows = seq_tensor((b, h, kv_len, d), 0.9)?;
    let k = k_rows.transpose(2, 3)?.contiguous()?;
    let v = seq_tensor((b, h, kv_len, d), 1.7)?;

    let out = QuantizedAttention::new(no_smoothing()).attend(&q, &k, &v, None, false)?;
    let scores = out.pre_softmax_scores.flatten_all()?.to_vec1::<f32>()?;

    let q_int = Int8Rows::from_tensor(&q)?;
    let k_int = Int8Rows::from_tensor(&k_rows)?;
    let inv_sqrt_d = 1.0 / (d as f32).sqrt();
    for bh in 0..b * h {
        for i in 0..q_len {
            for j in 0..kv_len {
                let (qr, kr) = (bh * q_len + i, bh * kv_len + j);
                let dot = q_int.dot(qr, &k_int, kr).expect("rows in range") as f32;
                let scale = q_int.scale(qr).zip(k_int.scale(kr)).map(|(a, b)| a * b);
                let expected = dot * scale.expect("rows in range") * inv_sqrt_d;
                let got = scores[(bh * q_len + i) * kv_len + j];
                assert!((got - expected).abs() < 1e-5, "{got} vs {expected}");
            }
        }
    }
    Ok(())
}

#[test]
fn int8_path_tracks_the_exact_reference() -> Result<()> {
    let (b, h, q_len, kv_len, d) = (2, 4, 6, 6, 32);
    let q = seq_tensor((b, h, q_len, d), 0.2)?;
    let k = seq_tensor((b, h, d, kv_len), 0.4)?;
    let v = seq_tensor((b, h, kv_len, d), 0.6)?;
    let config = Config {
        weights_dtype: ReducedPrecision::F32,
        ..Config::default()
    };

    let quantized = QuantizedAttention::new(config.clone()).attend(&q, &k, &v, None, true)?;
    let exact = ExactAttention::new(config).attend(&q, &k, &v, None, true)?;

    assert!(max_diff(&quantized.pre_softmax_scores, &exact.pre_softmax_scores)? < 5e-2);
    assert!(max_diff(&quantized.output, &exact.output)? < 5e-2);
    Ok(())
}

#[test]
fn causal_output_ignores_future_keys() -> Result<()> {
    let (b, h, len, d) = (1, 2, 5, 8);
    let q = seq_tensor((b, h, len, d), 0.0)?;
    let k = seq_tensor((b, h, d, len), 1.0)?;
    let v = seq_tensor((b, h, len, d), 2.0)?;
    let kernel = QuantizedAttention::new(no_smoothing());
    let base = kernel.attend(&q, &k, &v, None, true)?.output;

    // Perturb key/value position 3 only.
    let k_changed = k.slice_assign(&[0..b, 0..h, 0..d, 3..4], &(k.narrow(3, 3, 1)? * 5.0)?)?;
    let v_changed = v.slice_assign(&[0..b, 0..h, 3..4, 0..d], &(v.narrow(2, 3, 1)? + 3.0)?)?;
    let changed = kernel.attend(&q, &k_changed, &v_changed, None, true)?.output;

    assert_eq!(max_diff(&base.narrow(2, 0, 3)?, &changed.narrow(2, 0, 3)?)?, 0.0);
    assert!(max_diff(&base.narrow(2, 3, 2)?, &changed.narrow(2, 3, 2)?)? > 1e-3);
    Ok(())
}

#[test]
fn additive_padding_mask_drops_keys() -> Result<()> {
    let (b, h, q_len, kv_len, d) = (1, 1, 2, 4, 4);
    let q = seq_tensor((b, h, q_len, d), 0.3)?;
    let k = seq_tensor((b, h, d, kv_len), 0.5)?;
    let v = seq_tensor((b, h, kv_len, d), 0.7)?;
    let mask = padding_mask_from_lengths(&Device::Cpu, &[2], q_len, kv_len)?;
    let kernel = ExactAttention::new(no_smoothing());

    let masked = kernel.attend(&q, &k, &v, Some(&mask), false)?;
    let truncated = kernel.attend(
        &q,
        &k.narrow(3, 0, 2)?.contiguous()?,
        &v.narrow(2, 0, 2)?.contiguous()?,
        None,
        false,
    )?;
    assert!(max_diff(&masked.output, &truncated.output)? < 1e-6);
    // Pre-softmax scores are reported before masking.
    assert_eq!(masked.pre_softmax_scores.dims(), &[1, 1, 2, 4]);
    Ok(())
}

#[test]
fn smoothing_shifts_scores_but_not_weights() -> Result<()> {
    let (b, h, q_len, kv_len, d) = (1, 2, 3, 3, 8);
    let q = seq_tensor((b, h, q_len, d), 0.8)?;
    let k = (seq_tensor((b, h, d, kv_len), 0.1)? + 2.0)?;
    let v = seq_tensor((b, h, kv_len, d), 0.2)?;

    let plain = ExactAttention::new(no_smoothing()).attend(&q, &k, &v, None, false)?;
    let smoothed = ExactAttention::new(Config::default()).attend(&q, &k, &v, None, false)?;

    assert!(max_diff(&plain.pre_softmax_scores, &smoothed.pre_softmax_scores)? > 1e-2);
    // A per-query constant shift leaves the softmax unchanged.
    assert!(max_diff(&plain.output, &smoothed.output)? < 1e-5);
    Ok(())
}

#[test]
fn output_dtype_follows_queries() -> Result<()> {
    let q = seq_tensor((1, 1, 2, 4), 0.0)?.to_dtype(DType::BF16)?;
    let k = seq_tensor((1, 1, 4, 2), 0.0)?.to_dtype(DType::BF16)?;
    let v = seq_tensor((1, 1, 2, 4), 0.0)?.to_dtype(DType::BF16)?;
    let out = QuantizedAttention::new(Config::default()).attend(&q, &k, &v, None, true)?;
    assert_eq!(out.output.dtype(), DType::BF16);
    assert_eq!(out.pre_softmax_scores.dtype(), DType::F32);
    let sums = out.output.to_dtype(DType::F32)?.sum(D::Minus1)?;
    assert!(sums.flatten_all()?.to_vec1::<f32>()?.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn shape_and_dtype_violations_are_reported() -> Result<()> {
    let kernel = QuantizedAttention::new(Config::default());
    let q = seq_tensor((1, 2, 1, 4), 0.0)?;
    let v = seq_tensor((1, 2, 3, 4), 0.0)?;

    // k given as [b, h, kv, d] instead of [b, h, d, kv]
    let k_wrong = seq_tensor((1, 2, 3, 4), 0.0)?;
    assert!(matches!(
        kernel.attend(&q, &k_wrong, &v, None, false),
        Err(AttentionError::InvalidShape { .. })
    ));

    let k = seq_tensor((1, 2, 4, 3), 0.0)?;
    let bad_mask = Tensor::zeros((1, 2, 1, 5), DType::F32, &Device::Cpu)?;
    assert!(matches!(
        kernel.attend(&q, &k, &v, Some(&bad_mask), false),
        Err(AttentionError::InvalidShape { .. })
    ));

    let q_f64 = q.to_dtype(DType::F64)?;
    assert!(matches!(
        kernel.attend(&q_f64, &k, &v, None, false),
        Err(AttentionError::UnsupportedDType { .. })
    ));

    let v_half = v.to_dtype(DType::F16)?;
    assert!(kernel.attend(&q, &k, &v_half, None, false).is_err());
    Ok(())
}
