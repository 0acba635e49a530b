//! Builders for causal attention masks.

use candle_core::{Device, Result, Tensor};

/// Causal mask shaped `[1, 1, q_len, k_len]`.
///
/// Queries align with the most recent `q_len` keys: query `i` may attend to
/// keys `0..=k_len - q_len + i`. When `k_len < q_len` the offset saturates
/// at zero.
pub fn build_causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let data: Vec<f32> = (0..q_len)
        .flat_map(|q| {
            (0..k_len).map(move |k| if k > q + offset { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Tensor::from_vec(data, (1, 1, q_len, k_len), device)
}
