//! Attention kernels and key/value cache for incremental decoding.
//!
//! Two score kernels share the [`Attention`] trait: [`QuantizedAttention`]
//! computes query/key similarities on int8 rows with per-row scales, and
//! [`ExactAttention`] does the same in f32 as a numerical reference. Both
//! expose the scaled pre-softmax scores alongside the output so callers can
//! derive entropy statistics.
//!
//! [`KvCache`] keeps one preallocated history per layer and repeats kv heads
//! for grouped-query attention when handing the history back.

pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod quantized;
pub mod reference;

pub use crate::core::{
    kernel_for, Attention, AttentionError, AttentionOutput, CausalMode, Config, KernelKind,
    ReducedPrecision,
};
pub use kv_cache::{CacheConfig, KeyValueCache, KvCache};
pub use quantized::QuantizedAttention;
pub use reference::ExactAttention;
