//! Key/value cache for incremental decoding.
//!
//! One preallocated key and value tensor per layer, shaped
//! `[batch, max_seq_len, kv_heads, head_dim]`, written in place as decoding
//! advances. The cache has a single owner per session.

pub mod api;
pub mod layout;
pub mod store;

pub use api::KeyValueCache;
pub use layout::CacheConfig;
pub use store::{repeat_kv, KvCache};
