//! Geometry of a key/value cache allocation.

use candle_core::{DType, Device};

use crate::core::AttentionError;

/// Dimensions, dtype and device of every per-layer cache tensor.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub batch: usize,
    pub layers: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub max_seq_len: usize,
    pub dtype: DType,
    pub device: Device,
}

impl CacheConfig {
    pub fn new(
        batch: usize,
        layers: usize,
        kv_heads: usize,
        head_dim: usize,
        max_seq_len: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self, AttentionError> {
        if batch == 0 || layers == 0 || kv_heads == 0 || head_dim == 0 || max_seq_len == 0 {
            return Err(AttentionError::shape(format!(
                "kv cache dimensions must be non-zero: batch={batch} layers={layers} kv_heads={kv_heads} head_dim={head_dim} max_seq_len={max_seq_len}"
            )));
        }
        let cfg = Self {
            batch,
            layers,
            kv_heads,
            head_dim,
            max_seq_len,
            dtype,
            device,
        };
        log::info!(
            "kv-cache init: batch={} layers={} kv_heads={} head_dim={} max_seq_len={} dtype={:?}",
            cfg.batch,
            cfg.layers,
            cfg.kv_heads,
            cfg.head_dim,
            cfg.max_seq_len,
            cfg.dtype
        );
        Ok(cfg)
    }

    /// Shape of one layer's key (or value) tensor.
    pub fn layer_shape(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.max_seq_len, self.kv_heads, self.head_dim)
    }
}
