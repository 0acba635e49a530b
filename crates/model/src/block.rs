use std::fmt;

use attention::{Attention, KeyValueCache, KvCache};
use candle_core::Tensor;
use embedding::{apply_rotary_emb, FreqsCis};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearLayer},
    mlp::{FeedForwardConfig, GatedFeedForward},
    norm::{NormConfig, NormalizationLayer, RmsNorm},
};

use crate::config::ModelParams;
use crate::error::ModelError;
use crate::weights::LayerWeights;

/// Per-call inputs shared by every layer of one forward pass.
pub struct LayerContext<'a> {
    /// Absolute position of the first token of this call.
    pub cur_pos: usize,
    /// Rotary tables for positions `[cur_pos, cur_pos + seq)`.
    pub freqs: &'a FreqsCis,
    pub kernel: &'a dyn Attention,
    pub causal: bool,
    pub mask: Option<&'a Tensor>,
}

/// Pre-norm decoder layer: grouped-query attention over the cache followed by
/// a gated feed-forward, each wrapped in a residual add.
pub struct DecoderLayer {
    index: usize,
    dim: usize,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    policy: PrecisionPolicy,
    attention_norm: RmsNorm,
    ffn_norm: RmsNorm,
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
    ffn: GatedFeedForward,
}

impl fmt::Debug for DecoderLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderLayer")
            .field("index", &self.index)
            .field("dim", &self.dim)
            .field("n_heads", &self.n_heads)
            .field("n_kv_heads", &self.n_kv_heads)
            .field("head_dim", &self.head_dim)
            .finish()
    }
}

impl DecoderLayer {
    pub fn new(
        index: usize,
        weights: &LayerWeights,
        params: &ModelParams,
    ) -> Result<Self, ModelError> {
        weights.validate(params, index)?;
        let norm_config = NormConfig {
            epsilon: params.norm_eps,
            ..NormConfig::new(params.dim)
        };
        let ffn = GatedFeedForward::new(
            FeedForwardConfig::new(params.dim, params.ffn_dim),
            Linear::from_weight(weights.w1.clone())?,
            Linear::from_weight(weights.w3.clone())?,
            Linear::from_weight(weights.w2.clone())?,
        )?;
        Ok(Self {
            index,
            dim: params.dim,
            n_heads: params.n_heads,
            n_kv_heads: params.n_kv_heads,
            head_dim: params.head_dim,
            policy: PrecisionPolicy::from_parameter_dtype(params.dtype()),
            attention_norm: RmsNorm::new(weights.attention_norm.clone(), norm_config.clone())?,
            ffn_norm: RmsNorm::new(weights.ffn_norm.clone(), norm_config)?,
            wq: Linear::from_weight(weights.wq.clone())?,
            wk: Linear::from_weight(weights.wk.clone())?,
            wv: Linear::from_weight(weights.wv.clone())?,
            wo: Linear::from_weight(weights.wo.clone())?,
            ffn,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Runs the layer on `hidden` `[batch, seq, dim]`, writing this step's keys
    /// and values into `cache`.
    ///
    /// Returns the new hidden state and the layer's pre-softmax scores
    /// `[batch, n_heads, seq, cur_pos + seq]`.
    pub fn forward(
        &self,
        hidden: &Tensor,
        ctx: &LayerContext<'_>,
        cache: &mut KvCache,
    ) -> Result<(Tensor, Tensor), ModelError> {
        checks::expect_batch_seq_hidden("layer.input", hidden, self.dim)?;

        let normed = self.attention_norm.forward(hidden, &self.policy)?;
        let (attn, scores) = self.attention(&normed, ctx, cache)?;
        let hidden = (hidden + attn)?;

        let normed = self.ffn_norm.forward(&hidden, &self.policy)?;
        let ffn = self.ffn.forward(&normed, &self.policy)?;
        Ok(((hidden + ffn)?, scores))
    }

    fn attention(
        &self,
        normed: &Tensor,
        ctx: &LayerContext<'_>,
        cache: &mut KvCache,
    ) -> Result<(Tensor, Tensor), ModelError> {
        let (batch, seq, _) = normed.dims3()?;
        let q = self
            .wq
            .forward(normed, &self.policy)?
            .reshape((batch, seq, self.n_heads, self.head_dim))?;
        let k = self
            .wk
            .forward(normed, &self.policy)?
            .reshape((batch, seq, self.n_kv_heads, self.head_dim))?;
        let v = self
            .wv
            .forward(normed, &self.policy)?
            .reshape((batch, seq, self.n_kv_heads, self.head_dim))?;

        let (q, k) = apply_rotary_emb(&q, &k, ctx.freqs)?;
        let n_rep = self.n_heads / self.n_kv_heads;
        let (keys, values) = cache.update(&k, &v, self.index, ctx.cur_pos, n_rep)?;

        // q: [b, h, s, d], keys: [b, h, d, kv], values: [b, h, kv, d]
        let q = q.transpose(1, 2)?.contiguous()?;
        let keys = keys.permute((0, 2, 3, 1))?.contiguous()?;
        let values = values.transpose(1, 2)?.contiguous()?;
        let out = ctx.kernel.attend(&q, &keys, &values, ctx.mask, ctx.causal)?;

        let merged = out
            .output
            .to_dtype(self.policy.storage())?
            .transpose(1, 2)?
            .reshape((batch, seq, self.n_heads * self.head_dim))?;
        let projected = self.wo.forward(&merged, &self.policy)?;
        Ok((projected, out.pre_softmax_scores))
    }
}
