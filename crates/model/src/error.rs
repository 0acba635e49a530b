//! Error type surfaced by model assembly and the forward pass.

use attention::AttentionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    /// Inconsistent model parameters or weights that do not match them.
    #[error("invalid model configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        ModelError::Config(message.into())
    }
}
