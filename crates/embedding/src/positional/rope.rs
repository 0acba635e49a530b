//! Rotary positional embeddings.
//!
//! Query/key vectors are read as `head_dim / 2` complex pairs (real part at the
//! even index, imaginary part at the odd index) and multiplied by
//! `cos θ + i·sin θ`, where `θ = position · freq_j`. The tables live in
//! [`FreqsCis`] as two f32 tensors shaped `[positions, head_dim / 2]`.

use candle_core::{bail, DType, Device, Result, Tensor};

/// Default base angle used by Llama-3 checkpoints.
pub const DEFAULT_ROPE_THETA: f32 = 500_000.0;

/// Configuration for building rotary frequency tables.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality of the rotated vectors; must be even.
    pub head_dim: usize,
    /// Base angle θ controlling the frequency spectrum.
    pub rope_theta: f32,
    /// Frequency rescaling applied for extended contexts.
    pub scaling: RopeScaling,
}

impl RopeConfig {
    pub fn new(head_dim: usize) -> Self {
        Self {
            head_dim,
            rope_theta: DEFAULT_ROPE_THETA,
            scaling: RopeScaling::None,
        }
    }

    /// Short description of the frequency setup, used in log lines.
    pub fn fingerprint(&self) -> String {
        let mode = match &self.scaling {
            RopeScaling::None => "none".to_owned(),
            RopeScaling::Llama3 {
                factor,
                low_freq_factor,
                high_freq_factor,
                original_context,
            } => format!(
                "llama3(factor={factor},low={low_freq_factor},high={high_freq_factor},ctx={original_context})"
            ),
        };
        format!(
            "head_dim={};theta={:.1};scaling={}",
            self.head_dim, self.rope_theta, mode
        )
    }

    /// Per-pair inverse frequencies after scaling, in f64.
    pub fn inverse_frequencies(&self) -> Result<Vec<f64>> {
        if self.head_dim == 0 || self.head_dim % 2 != 0 {
            bail!("rope head_dim must be even and non-zero, got {}", self.head_dim);
        }
        if self.rope_theta.is_nan() || self.rope_theta <= 0.0 {
            bail!("rope_theta must be positive, got {}", self.rope_theta);
        }
        let half = self.head_dim / 2;
        let theta = self.rope_theta as f64;
        let freqs = (0..half)
            .map(|j| 1.0 / theta.powf((2 * j) as f64 / self.head_dim as f64))
            .map(|freq| self.scaling.rescale(freq))
            .collect();
        Ok(freqs)
    }
}

/// Frequency rescaling strategies.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RopeScaling {
    /// Plain RoPE.
    #[default]
    None,
    /// Llama-3.1 wavelength-dependent rescaling.
    ///
    /// Wavelengths shorter than `original_context / high_freq_factor` are kept,
    /// longer than `original_context / low_freq_factor` are divided by
    /// `factor`, and the band in between is interpolated.
    Llama3 {
        factor: f64,
        low_freq_factor: f64,
        high_freq_factor: f64,
        original_context: usize,
    },
}

impl RopeScaling {
    /// The constants shipped with Llama-3.1/3.2 checkpoints.
    pub fn llama3() -> Self {
        RopeScaling::Llama3 {
            factor: 8.0,
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
            original_context: 8192,
        }
    }

    fn rescale(&self, freq: f64) -> f64 {
        match *self {
            RopeScaling::None => freq,
            RopeScaling::Llama3 {
                factor,
                low_freq_factor,
                high_freq_factor,
                original_context,
            } => {
                let context = original_context as f64;
                let low_freq_wavelen = context / low_freq_factor;
                let high_freq_wavelen = context / high_freq_factor;
                let wavelen = 2.0 * std::f64::consts::PI / freq;
                if wavelen < high_freq_wavelen {
                    freq
                } else if wavelen > low_freq_wavelen {
                    freq / factor
                } else {
                    let smooth = (context / wavelen - low_freq_factor)
                        / (high_freq_factor - low_freq_factor);
                    (1.0 - smooth) * freq / factor + smooth * freq
                }
            }
        }
    }
}

/// Cosine/sine tables for a contiguous run of positions.
#[derive(Debug, Clone)]
pub struct FreqsCis {
    cos: Tensor,
    sin: Tensor,
}

impl FreqsCis {
    /// Builds the tables for positions `[0, max_seq_len)`.
    pub fn precompute(cfg: &RopeConfig, max_seq_len: usize, device: &Device) -> Result<Self> {
        if max_seq_len == 0 {
            bail!("rope tables need at least one position");
        }
        let inv_freqs = cfg.inverse_frequencies()?;
        let half = inv_freqs.len();

        let mut cos = Vec::with_capacity(max_seq_len * half);
        let mut sin = Vec::with_capacity(max_seq_len * half);
        for pos in 0..max_seq_len {
            for &freq in &inv_freqs {
                let angle = pos as f64 * freq;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }
        log::debug!(
            "precomputed rope tables: positions={} {}",
            max_seq_len,
            cfg.fingerprint()
        );

        Ok(Self {
            cos: Tensor::from_vec(cos, (max_seq_len, half), device)?,
            sin: Tensor::from_vec(sin, (max_seq_len, half), device)?,
        })
    }

    /// Wraps caller-provided tables; both must be f32 `[positions, half]`.
    pub fn from_parts(cos: Tensor, sin: Tensor) -> Result<Self> {
        if cos.rank() != 2 || cos.dims() != sin.dims() {
            bail!(
                "freqs cos/sin must share a [positions, head_dim/2] shape, got {:?} and {:?}",
                cos.dims(),
                sin.dims()
            );
        }
        Ok(Self {
            cos: cos.to_dtype(DType::F32)?,
            sin: sin.to_dtype(DType::F32)?,
        })
    }

    /// Angle-zero table: `cos = 1`, `sin = 0`.
    pub fn identity(positions: usize, half_dim: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            cos: Tensor::ones((positions, half_dim), DType::F32, device)?,
            sin: Tensor::zeros((positions, half_dim), DType::F32, device)?,
        })
    }

    /// Rows `[start, start + len)`.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        if start.checked_add(len).map_or(true, |end| end > self.len()) {
            bail!(
                "rope positions [{}, +{}) exceed the {} precomputed rows",
                start,
                len,
                self.len()
            );
        }
        Ok(Self {
            cos: self.cos.narrow(0, start, len)?,
            sin: self.sin.narrow(0, start, len)?,
        })
    }

    /// Number of positions covered.
    pub fn len(&self) -> usize {
        self.cos.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of complex pairs per head.
    pub fn half_dim(&self) -> usize {
        self.cos.dims()[1]
    }

    pub fn cos(&self) -> &Tensor {
        &self.cos
    }

    pub fn sin(&self) -> &Tensor {
        &self.sin
    }
}

/// Rotates `q` and `k` shaped `[batch, seq, heads, head_dim]` by `freqs`.
///
/// `freqs` must cover exactly `seq` positions. Head counts of `q` and `k` may
/// differ (grouped-query attention). The rotation runs in f32 and the outputs
/// are cast back to each input's dtype.
pub fn apply_rotary_emb(q: &Tensor, k: &Tensor, freqs: &FreqsCis) -> Result<(Tensor, Tensor)> {
    let (batch, seq, _, head_dim) = q.dims4()?;
    let (k_batch, k_seq, _, k_head_dim) = k.dims4()?;
    if (k_batch, k_seq, k_head_dim) != (batch, seq, head_dim) {
        bail!(
            "q/k batch, seq or head_dim mismatch: q={:?} k={:?}",
            q.dims(),
            k.dims()
        );
    }
    if head_dim % 2 != 0 {
        bail!("rotary embedding needs an even head_dim, got {head_dim}");
    }
    if freqs.len() != seq || freqs.half_dim() != head_dim / 2 {
        bail!(
            "freqs table {:?} does not cover [{}, {}]",
            freqs.cos.dims(),
            seq,
            head_dim / 2
        );
    }

    let cos = freqs.cos.reshape((1, seq, 1, head_dim / 2))?;
    let sin = freqs.sin.reshape((1, seq, 1, head_dim / 2))?;
    Ok((rotate(q, &cos, &sin)?, rotate(k, &cos, &sin)?))
}

fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (batch, seq, heads, head_dim) = x.dims4()?;
    let half = head_dim / 2;
    let pairs = x
        .to_dtype(DType::F32)?
        .reshape((batch, seq, heads, half, 2))?;
    let re = pairs.narrow(4, 0, 1)?.squeeze(4)?;
    let im = pairs.narrow(4, 1, 1)?.squeeze(4)?;

    let out_re = (re.broadcast_mul(cos)? - im.broadcast_mul(sin)?)?;
    let out_im = (re.broadcast_mul(sin)? + im.broadcast_mul(cos)?)?;

    Tensor::stack(&[&out_re, &out_im], 4)?
        .reshape((batch, seq, heads, head_dim))?
        .to_dtype(x.dtype())
}
