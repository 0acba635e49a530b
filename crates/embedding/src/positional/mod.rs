//! Positional encodings.

pub mod rope;

pub use rope::{apply_rotary_emb, FreqsCis, RopeConfig, RopeScaling, DEFAULT_ROPE_THETA};
