//! Preallocated in-place key/value cache.
//!
//! Each layer owns a key and a value tensor shaped
//! `[batch, max_seq_len, kv_heads, head_dim]`. Updates write the new step with
//! `slice_set` along the sequence axis, so no reallocation happens after
//! construction. Returned histories are fresh tensors: later writes never show
//! through them.

use std::cell::Cell;
use std::marker::PhantomData;

use candle_core::Tensor;

use crate::core::AttentionError;
use crate::kv_cache::api::KeyValueCache;
use crate::kv_cache::layout::CacheConfig;

#[derive(Debug)]
struct LayerCache {
    keys: Tensor,
    values: Tensor,
    len: usize,
}

impl LayerCache {
    fn new(config: &CacheConfig) -> Result<Self, AttentionError> {
        let shape = config.layer_shape();
        Ok(Self {
            keys: Tensor::zeros(shape, config.dtype, &config.device)?,
            values: Tensor::zeros(shape, config.dtype, &config.device)?,
            len: 0,
        })
    }
}

/// Per-session key/value history. `Send` but not `Sync`.
#[derive(Debug)]
pub struct KvCache {
    config: CacheConfig,
    layers: Vec<LayerCache>,
    _not_sync: PhantomData<Cell<()>>,
}

impl KvCache {
    pub fn new(config: CacheConfig) -> Result<Self, AttentionError> {
        let layers = (0..config.layers)
            .map(|_| LayerCache::new(&config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            config,
            layers,
            _not_sync: PhantomData,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn check_step(&self, name: &str, tensor: &Tensor) -> Result<usize, AttentionError> {
        let (batch, step_len, kv_heads, head_dim) = tensor.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "{name} must be [batch, step_len, kv_heads, head_dim], got {:?}",
                tensor.dims()
            ))
        })?;
        let cfg = &self.config;
        if (batch, kv_heads, head_dim) != (cfg.batch, cfg.kv_heads, cfg.head_dim) || step_len == 0
        {
            return Err(AttentionError::shape(format!(
                "{name} {:?} does not match cache geometry [{}, 1..={}, {}, {}]",
                tensor.dims(),
                cfg.batch,
                cfg.max_seq_len,
                cfg.kv_heads,
                cfg.head_dim
            )));
        }
        if !tensor.dtype().is_float() {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{:?}", tensor.dtype()),
            });
        }
        Ok(step_len)
    }
}

impl KeyValueCache for KvCache {
    fn update(
        &mut self,
        keys: &Tensor,
        values: &Tensor,
        layer: usize,
        cur_pos: usize,
        n_rep: usize,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        if layer >= self.layers.len() {
            return Err(AttentionError::shape(format!(
                "layer index {layer} out of range for {} cached layers",
                self.layers.len()
            )));
        }
        if n_rep == 0 {
            return Err(AttentionError::InvalidHeadGrouping {
                n_heads: 0,
                n_kv_heads: self.config.kv_heads,
            });
        }
        let step_len = self.check_step("keys", keys)?;
        if self.check_step("values", values)? != step_len {
            return Err(AttentionError::shape(format!(
                "keys {:?} and values {:?} cover different step lengths",
                keys.dims(),
                values.dims()
            )));
        }
        let max_seq_len = self.config.max_seq_len;
        let end = cur_pos
            .checked_add(step_len)
            .filter(|&end| end <= max_seq_len)
            .ok_or(AttentionError::CacheOverflow {
                layer,
                cur_pos,
                step_len,
                max_seq_len,
            })?;

        let dtype = self.config.dtype;
        let entry = &mut self.layers[layer];
        entry
            .keys
            .slice_set(&keys.to_dtype(dtype)?.contiguous()?, 1, cur_pos)?;
        entry
            .values
            .slice_set(&values.to_dtype(dtype)?.contiguous()?, 1, cur_pos)?;
        entry.len = entry.len.max(end);

        log::debug!(
            "kv-cache write layer={} positions={}..{} n_rep={}",
            layer,
            cur_pos,
            end,
            n_rep
        );

        let keys = repeat_kv(&entry.keys.narrow(1, 0, end)?, n_rep)?;
        let values = repeat_kv(&entry.values.narrow(1, 0, end)?, n_rep)?;
        Ok((keys, values))
    }

    fn len(&self, layer: usize) -> usize {
        self.layers.get(layer).map_or(0, |entry| entry.len)
    }

    fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    fn reset(&mut self) -> Result<(), AttentionError> {
        let zeros = Tensor::zeros(
            self.config.layer_shape(),
            self.config.dtype,
            &self.config.device,
        )?;
        for entry in &mut self.layers {
            entry.keys.slice_set(&zeros, 1, 0)?;
            entry.values.slice_set(&zeros, 1, 0)?;
            entry.len = 0;
        }
        Ok(())
    }
}

/// Repeats every kv head `n_rep` times along axis 2 of a
/// `[batch, len, kv_heads, head_dim]` tensor, so head `h * n_rep + j` is a
/// copy of kv head `h`. Always returns a freshly allocated tensor.
pub fn repeat_kv(tensor: &Tensor, n_rep: usize) -> Result<Tensor, AttentionError> {
    if n_rep == 1 {
        return Ok(if tensor.is_contiguous() {
            tensor.copy()?
        } else {
            tensor.contiguous()?
        });
    }
    let (batch, len, kv_heads, head_dim) = tensor.dims4()?;
    Ok(tensor
        .unsqueeze(3)?
        .broadcast_as((batch, len, kv_heads, n_rep, head_dim))?
        .reshape((batch, len, kv_heads * n_rep, head_dim))?)
}
