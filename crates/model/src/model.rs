use attention::{
    kernel_for, Attention, AttentionError, CacheConfig, Config as AttentionConfig, KeyValueCache,
    KvCache,
};
use candle_core::{Device, Tensor};
use embedding::{FreqsCis, TokenEmbedding};
use layers::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearLayer},
    norm::{NormConfig, NormalizationLayer, RmsNorm},
};

use crate::{
    block::{DecoderLayer, LayerContext},
    config::ModelParams,
    error::ModelError,
    stats::AttnStats,
    weights::XfmrWeights,
};

/// Everything one forward call produces besides the in-place cache update.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `[batch, seq, vocab_size]`
    pub logits: Tensor,
    /// Last layer pre-softmax scores, `[batch, n_heads, seq, kv_len]`.
    pub scores: Tensor,
    /// Last layer scores of the final query position, `[batch, n_heads, kv_len]`.
    pub last_scores: Tensor,
    pub stats: AttnStats,
}

/// Decoder-only transformer running incrementally over a [`KvCache`].
pub struct Transformer {
    params: ModelParams,
    attention: AttentionConfig,
    kernel: Box<dyn Attention + Send + Sync>,
    embedding: TokenEmbedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    output: Linear,
    policy: PrecisionPolicy,
}

impl Transformer {
    /// Assembles the model, checking `weights` against `params`.
    pub fn new(
        params: ModelParams,
        attention: AttentionConfig,
        weights: &XfmrWeights,
    ) -> Result<Self, ModelError> {
        params.validate()?;
        weights.validate(&params)?;

        let layers = weights
            .layers
            .iter()
            .enumerate()
            .map(|(index, layer)| DecoderLayer::new(index, layer, &params))
            .collect::<Result<Vec<_>, _>>()?;
        let norm_config = NormConfig {
            epsilon: params.norm_eps,
            ..NormConfig::new(params.dim)
        };

        log::info!(
            "transformer ready: layers={} dim={} heads={}/{} head_dim={} vocab={} kernel={:?}",
            params.n_layers,
            params.dim,
            params.n_heads,
            params.n_kv_heads,
            params.head_dim,
            params.vocab_size,
            attention.kernel
        );

        Ok(Self {
            kernel: kernel_for(&attention),
            embedding: TokenEmbedding::from_weight(weights.tok_embeddings.clone())?,
            norm: RmsNorm::new(weights.norm.clone(), norm_config)?,
            output: Linear::from_weight(weights.output.clone())?,
            policy: PrecisionPolicy::from_parameter_dtype(params.dtype()),
            layers,
            attention,
            params,
        })
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn attention_config(&self) -> &AttentionConfig {
        &self.attention
    }

    /// Rotary tables covering every position up to `max_seq_len`.
    pub fn precompute_freqs(&self, device: &Device) -> Result<FreqsCis, ModelError> {
        Ok(FreqsCis::precompute(
            &self.params.rope_config(),
            self.params.max_seq_len,
            device,
        )?)
    }

    /// Allocates an empty cache for a session of `batch` sequences.
    pub fn new_cache(&self, batch: usize, device: &Device) -> Result<KvCache, ModelError> {
        let config = CacheConfig::new(
            batch,
            self.params.n_layers,
            self.params.n_kv_heads,
            self.params.head_dim,
            self.params.max_seq_len,
            self.params.dtype(),
            device.clone(),
        )?;
        Ok(KvCache::new(config)?)
    }

    /// Runs `tokens` `[batch, seq]`, placed at positions
    /// `[cur_pos, cur_pos + seq)`, through every layer.
    ///
    /// `freqs` must cover at least `cur_pos + seq` positions starting at 0 and
    /// `mask`, when given, must broadcast to `[batch, n_heads, seq, cur_pos + seq]`.
    /// All arguments are checked before the first layer runs, so a rejected
    /// call leaves `cache` untouched.
    pub fn forward(
        &self,
        tokens: &Tensor,
        cur_pos: usize,
        freqs: &FreqsCis,
        cache: &mut KvCache,
        mask: Option<&Tensor>,
    ) -> Result<ForwardOutput, ModelError> {
        self.embedding.validate(tokens)?;
        let (batch, seq) = tokens.dims2()?;
        let kv_len = self.check_cache(cache, tokens, cur_pos, seq)?;
        if freqs.half_dim() * 2 != self.params.head_dim {
            return Err(ModelError::config(format!(
                "rotary tables have {} pairs, expected head_dim / 2 = {}",
                freqs.half_dim(),
                self.params.head_dim / 2
            )));
        }
        let step_freqs = freqs.narrow(cur_pos, seq)?;
        if let Some(mask) = mask {
            let shape = (batch, self.params.n_heads, seq, kv_len);
            self.check_mask(mask, tokens.device(), shape)?;
        }

        log::debug!(
            "forward cur_pos={} seq_len={} kv_len={} batch={}",
            cur_pos,
            seq,
            kv_len,
            batch
        );

        let mut hidden = self.embedding.forward(tokens)?;
        let mut stats = AttnStats::new(
            batch,
            self.params.n_layers,
            self.params.n_heads,
            tokens.device(),
        )?;
        let ctx = LayerContext {
            cur_pos,
            freqs: &step_freqs,
            kernel: self.kernel.as_ref(),
            causal: self.attention.causal.resolve(cur_pos),
            mask,
        };

        let mut last_layer_scores = None;
        for layer in &self.layers {
            let (next, scores) = layer.forward(&hidden, &ctx, cache)?;
            stats.update(&scores.narrow(2, seq - 1, 1)?.squeeze(2)?, layer.index())?;
            hidden = next;
            last_layer_scores = Some(scores);
        }
        let scores = last_layer_scores
            .ok_or_else(|| ModelError::config("transformer has no layers"))?;
        let last_scores = scores.narrow(2, seq - 1, 1)?.squeeze(2)?;

        let normed = self.norm.forward(&hidden, &self.policy)?;
        let logits = self.output.forward(&normed, &self.policy)?;

        Ok(ForwardOutput {
            logits,
            scores,
            last_scores,
            stats,
        })
    }

    /// Checks `cache` against the model and the call, returning the history
    /// length after this step.
    fn check_cache(
        &self,
        cache: &KvCache,
        tokens: &Tensor,
        cur_pos: usize,
        seq: usize,
    ) -> Result<usize, ModelError> {
        let config = cache.config();
        let params = &self.params;
        let batch = tokens.dims()[0];
        if (config.batch, config.layers, config.kv_heads, config.head_dim)
            != (batch, params.n_layers, params.n_kv_heads, params.head_dim)
        {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "cache geometry batch={} layers={} kv_heads={} head_dim={} does not match \
                     batch={} layers={} kv_heads={} head_dim={}",
                    config.batch,
                    config.layers,
                    config.kv_heads,
                    config.head_dim,
                    batch,
                    params.n_layers,
                    params.n_kv_heads,
                    params.head_dim
                ),
            }
            .into());
        }
        if config.dtype != params.dtype() {
            return Err(AttentionError::UnsupportedDType {
                requested: format!(
                    "cache dtype {:?} for a {:?} model",
                    config.dtype,
                    params.dtype()
                ),
            }
            .into());
        }
        let weights_device = self.embedding.weight().device();
        if !config.device.same_device(weights_device)
            || !tokens.device().same_device(weights_device)
        {
            return Err(AttentionError::shape(
                "tokens, cache and weights must reside on the same device",
            )
            .into());
        }

        let capacity = params.max_seq_len.min(cache.max_seq_len());
        cur_pos
            .checked_add(seq)
            .filter(|&end| end <= capacity)
            .ok_or_else(|| {
                AttentionError::CacheOverflow {
                    layer: 0,
                    cur_pos,
                    step_len: seq,
                    max_seq_len: capacity,
                }
                .into()
            })
    }

    fn check_mask(
        &self,
        mask: &Tensor,
        device: &Device,
        shape: (usize, usize, usize, usize),
    ) -> Result<(), ModelError> {
        if !mask.device().same_device(device) {
            return Err(
                AttentionError::shape("mask must reside on the same device as tokens").into(),
            );
        }
        if mask.rank() > 4 || mask.broadcast_as(shape).is_err() {
            return Err(AttentionError::shape(format!(
                "mask {:?} does not broadcast to {:?}",
                mask.dims(),
                shape
            ))
            .into());
        }
        Ok(())
    }
}
