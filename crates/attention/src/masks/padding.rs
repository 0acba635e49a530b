//! Builders for padding masks used to drop padded keys.

use candle_core::{Device, Result, Tensor};

/// Padding mask shaped `[batch, 1, q_len, k_len]` from per-batch valid key
/// lengths. Keys at or beyond a batch element's length are discarded.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let batch = key_lengths.len();
    let mut data = vec![0f32; batch * q_len * k_len];

    for (b, &valid) in key_lengths.iter().enumerate() {
        let valid = valid.min(k_len);
        for q in 0..q_len {
            let row_start = (b * q_len + q) * k_len;
            data[row_start + valid..row_start + k_len].fill(f32::NEG_INFINITY);
        }
    }

    Tensor::from_vec(data, (batch, 1, q_len, k_len), device)
}
