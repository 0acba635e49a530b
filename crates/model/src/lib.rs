//! Decoder-only transformer over a quantized attention kernel.
//!
//! [`Transformer::forward`] consumes token ids at a given position, threads
//! the caller's [`attention::KvCache`] through every layer and returns logits
//! together with the pre-softmax scores and per-layer [`AttnStats`].

pub mod block;
pub mod config;
pub mod error;
pub mod model;
pub mod stats;
pub mod weights;

pub use block::{DecoderLayer, LayerContext};
pub use config::{ModelParams, WeightDType, XfmrConfig};
pub use error::ModelError;
pub use model::{ForwardOutput, Transformer};
pub use stats::AttnStats;
pub use weights::{LayerWeights, XfmrWeights};
