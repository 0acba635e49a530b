//! Model hyper-parameters and configuration file loading.
//!
//! A configuration file carries a `[model]` table deserialised into
//! [`ModelParams`] and an optional `[attention]` table for the kernel
//! options. TOML and JSON are both accepted; the format is picked from the
//! file extension.

use std::fs;
use std::path::Path;

use attention::Config as AttentionConfig;
use candle_core::DType;
use embedding::{RopeConfig, RopeScaling, DEFAULT_ROPE_THETA};
use layers::norm::DEFAULT_RMS_EPS;
use serde::Deserialize;

use crate::error::ModelError;

/// Storage dtype of weights, activations and the key/value cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightDType {
    #[default]
    F32,
    F16,
    Bf16,
}

impl WeightDType {
    pub fn dtype(self) -> DType {
        match self {
            WeightDType::F32 => DType::F32,
            WeightDType::F16 => DType::F16,
            WeightDType::Bf16 => DType::BF16,
        }
    }
}

fn default_norm_eps() -> f64 {
    DEFAULT_RMS_EPS
}

fn default_rope_theta() -> f32 {
    DEFAULT_ROPE_THETA
}

/// Decoder hyper-parameters, immutable for the lifetime of a model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelParams {
    pub vocab_size: usize,
    /// Width of the residual stream.
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    /// Inner width of the gated feed-forward.
    pub ffn_dim: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    /// Apply llama3 frequency scaling to the rotary table.
    #[serde(default)]
    pub use_scaled_rope: bool,
    pub max_seq_len: usize,
    #[serde(default)]
    pub dtype: WeightDType,
}

impl ModelParams {
    /// Llama 3.2 1B geometry.
    pub fn llama_1b() -> Self {
        Self {
            vocab_size: 128_256,
            dim: 2048,
            n_layers: 16,
            n_heads: 32,
            n_kv_heads: 8,
            head_dim: 64,
            ffn_dim: 8192,
            norm_eps: DEFAULT_RMS_EPS,
            rope_theta: DEFAULT_ROPE_THETA,
            use_scaled_rope: true,
            max_seq_len: 4096,
            dtype: WeightDType::Bf16,
        }
    }

    /// Small grouped-query geometry for tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 32,
            dim: 16,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 2,
            head_dim: 4,
            ffn_dim: 32,
            norm_eps: DEFAULT_RMS_EPS,
            rope_theta: 10_000.0,
            use_scaled_rope: false,
            max_seq_len: 16,
            dtype: WeightDType::F32,
        }
    }

    /// Query heads sharing each key/value head.
    pub fn n_rep(&self) -> usize {
        self.n_heads / self.n_kv_heads.max(1)
    }

    pub fn dtype(&self) -> DType {
        self.dtype.dtype()
    }

    /// Rotary configuration derived from `head_dim`, `rope_theta` and
    /// `use_scaled_rope`.
    pub fn rope_config(&self) -> RopeConfig {
        let mut cfg = RopeConfig::new(self.head_dim);
        cfg.rope_theta = self.rope_theta;
        cfg.scaling = if self.use_scaled_rope {
            RopeScaling::llama3()
        } else {
            RopeScaling::None
        };
        cfg
    }

    /// Checks the structural invariants every component relies on.
    pub fn validate(&self) -> Result<(), ModelError> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("dim", self.dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("head_dim", self.head_dim),
            ("ffn_dim", self.ffn_dim),
            ("max_seq_len", self.max_seq_len),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(ModelError::config(format!("{name} must be greater than zero")));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(ModelError::config(format!(
                "n_heads ({}) must be a multiple of n_kv_heads ({})",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(ModelError::config(format!(
                "head_dim ({}) must be even for the rotary transform",
                self.head_dim
            )));
        }
        if self.norm_eps.is_nan() || self.norm_eps <= 0.0 {
            return Err(ModelError::config("norm_eps must be positive"));
        }
        if self.rope_theta.is_nan() || self.rope_theta <= 0.0 {
            return Err(ModelError::config("rope_theta must be positive"));
        }
        Ok(())
    }
}

/// Contents of a configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct XfmrConfig {
    pub model: ModelParams,
    #[serde(default)]
    pub attention: AttentionConfig,
}

impl XfmrConfig {
    pub fn new(model: ModelParams) -> Self {
        Self {
            model,
            attention: AttentionConfig::default(),
        }
    }

    /// Loads and validates a configuration file, then applies `ATTN_*`
    /// environment overrides to the attention table.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: XfmrConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ModelError::config(format!(
                    "unsupported configuration extension '{other}'"
                )))
            }
        };
        config.model.validate()?;
        config.attention.apply_env_overrides();
        log::debug!(
            "loaded config from {}: {:?} attention={:?}",
            path.display(),
            config.model,
            config.attention
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() -> Result<(), ModelError> {
        ModelParams::tiny().validate()?;
        let llama = ModelParams::llama_1b();
        llama.validate()?;
        assert_eq!(llama.n_rep(), 4);
        assert_eq!(llama.n_heads * llama.head_dim, llama.dim);
        Ok(())
    }

    #[test]
    fn head_grouping_error_names_both_counts() {
        let params = ModelParams {
            n_heads: 6,
            n_kv_heads: 4,
            ..ModelParams::tiny()
        };
        let message = params.validate().unwrap_err().to_string();
        assert!(message.contains("n_heads (6)"), "{message}");
        assert!(message.contains("n_kv_heads (4)"), "{message}");
    }

    #[test]
    fn zero_sizes_and_odd_head_dim_are_rejected() {
        let zero = ModelParams {
            ffn_dim: 0,
            ..ModelParams::tiny()
        };
        assert!(zero.validate().unwrap_err().to_string().contains("ffn_dim"));

        let odd = ModelParams {
            head_dim: 3,
            ..ModelParams::tiny()
        };
        assert!(odd.validate().unwrap_err().to_string().contains("head_dim"));
    }

    #[test]
    fn defaults_fill_optional_fields() -> Result<(), ModelError> {
        let config: XfmrConfig = toml::from_str(
            r#"
            [model]
            vocab_size = 8
            dim = 4
            n_layers = 1
            n_heads = 1
            n_kv_heads = 1
            head_dim = 4
            ffn_dim = 8
            max_seq_len = 4
            "#,
        )?;
        assert_eq!(config.model.norm_eps, DEFAULT_RMS_EPS);
        assert_eq!(config.model.rope_theta, DEFAULT_ROPE_THETA);
        assert_eq!(config.model.dtype, WeightDType::F32);
        assert_eq!(config.attention, AttentionConfig::default());
        Ok(())
    }

    #[test]
    fn scaled_rope_selects_llama3_scaling() {
        let params = ModelParams::llama_1b();
        assert_eq!(params.rope_config().scaling, RopeScaling::llama3());
        assert_eq!(ModelParams::tiny().rope_config().scaling, RopeScaling::None);
    }
}
