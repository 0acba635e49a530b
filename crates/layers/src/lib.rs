//! Building blocks shared by the decoder layers.
//!
//! Everything here is precision-aware: parameters may be stored in reduced
//! formats while projections and statistics run in the dtypes chosen by
//! [`dtypes::PrecisionPolicy`].

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;

pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearLayer};
pub use mlp::{FeedForwardConfig, GatedFeedForward};
pub use norm::{NormConfig, NormalizationLayer, RmsNorm};
