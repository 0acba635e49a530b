//! Additive mask builders.
//!
//! Masks are `f32` tensors holding `0.0` (keep) or `f32::NEG_INFINITY`
//! (discard), shaped so they broadcast against
//! `[batch, heads, q_len, k_len]` scores.

pub mod causal;
pub mod padding;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::build_causal_mask;
pub use padding::padding_mask_from_lengths;
