//! Configuration options shared by all attention kernels.
//!
//! [`Config`] is deserialised from the `[attention]` table of a model config
//! file and may then be adjusted through `ATTN_*` environment variables:
//!
//! - `ATTN_SMOOTH_K` (`0 | 1 | true | false`) toggles key smoothing.
//! - `ATTN_WEIGHTS_DTYPE` (`f16 | bf16 | f32`) selects the dtype used for the
//!   softmax-weighted value sum.
//! - `ATTN_KERNEL` (`int8 | exact`) picks the score kernel.
//! - `ATTN_CAUSAL` (`always | after_prefill | never`) selects the causal policy.
//!
//! Unparseable values are ignored with a warning.

use std::env;

use candle_core::DType;
use serde::Deserialize;

/// When the kernel applies causal masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CausalMode {
    /// Every call is causal; a no-op for single-token decode.
    #[default]
    Always,
    /// Only calls with `cur_pos > 0` are causal, prefill attends bidirectionally.
    AfterPrefill,
    Never,
}

impl CausalMode {
    /// Whether a call starting at `cur_pos` should be masked causally.
    pub fn resolve(self, cur_pos: usize) -> bool {
        match self {
            CausalMode::Always => true,
            CausalMode::AfterPrefill => cur_pos > 0,
            CausalMode::Never => false,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "always" => Some(CausalMode::Always),
            "after_prefill" | "after-prefill" => Some(CausalMode::AfterPrefill),
            "never" => Some(CausalMode::Never),
            _ => None,
        }
    }
}

/// Score kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelKind {
    /// Int8 Q/K scores with per-row scales.
    #[default]
    Int8,
    /// Full f32 scores, used as the numerical reference.
    Exact,
}

impl KernelKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "int8" | "quantized" => Some(KernelKind::Int8),
            "exact" | "f32" => Some(KernelKind::Exact),
            _ => None,
        }
    }
}

/// Dtype of the softmax weights and values in the final weighted sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReducedPrecision {
    #[default]
    F16,
    Bf16,
    F32,
}

impl ReducedPrecision {
    pub fn dtype(self) -> DType {
        match self {
            ReducedPrecision::F16 => DType::F16,
            ReducedPrecision::Bf16 => DType::BF16,
            ReducedPrecision::F32 => DType::F32,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "f16" | "fp16" => Some(ReducedPrecision::F16),
            "bf16" => Some(ReducedPrecision::Bf16),
            "f32" | "fp32" => Some(ReducedPrecision::F32),
            _ => None,
        }
    }
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Subtract the mean key (over the key-length axis) before quantizing.
    pub smooth_keys: bool,
    /// Precision of the weighted value sum.
    pub weights_dtype: ReducedPrecision,
    pub kernel: KernelKind,
    pub causal: CausalMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            smooth_keys: true,
            weights_dtype: ReducedPrecision::default(),
            kernel: KernelKind::default(),
            causal: CausalMode::default(),
        }
    }
}

impl Config {
    /// Defaults with `ATTN_*` overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Layers `ATTN_*` environment variables over the current values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_override("ATTN_SMOOTH_K", parse_flag) {
            self.smooth_keys = value;
        }
        if let Some(value) = env_override("ATTN_WEIGHTS_DTYPE", ReducedPrecision::parse) {
            self.weights_dtype = value;
        }
        if let Some(value) = env_override("ATTN_KERNEL", KernelKind::parse) {
            self.kernel = value;
        }
        if let Some(value) = env_override("ATTN_CAUSAL", CausalMode::parse) {
            self.causal = value;
        }
    }
}

fn env_override<T>(key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = env::var(key).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        log::warn!("ignoring unrecognised {}={:?}", key, raw);
    }
    parsed
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
