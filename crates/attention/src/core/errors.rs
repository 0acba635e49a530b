//! Error types emitted by attention kernels and the key/value cache.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A write would run past the end of the preallocated cache.
    #[error(
        "kv cache overflow on layer {layer}: writing {step_len} positions at {cur_pos} exceeds max_seq_len {max_seq_len}"
    )]
    CacheOverflow {
        layer: usize,
        cur_pos: usize,
        step_len: usize,
        max_seq_len: usize,
    },
    /// Query heads cannot be split evenly across key/value heads.
    #[error("cannot share {n_kv_heads} kv heads across {n_heads} query heads")]
    InvalidHeadGrouping { n_heads: usize, n_kv_heads: usize },
    /// A tensor backend failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub fn shape(context: impl Into<String>) -> Self {
        AttentionError::InvalidShape {
            context: context.into(),
        }
    }
}
