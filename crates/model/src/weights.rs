//! Weight containers.
//!
//! Loading checkpoints is left to the caller; these types only hold the
//! tensors and check them against [`ModelParams`]. [`XfmrWeights::random`]
//! builds a deterministic set for tests and smoke runs.

use candle_core::{DType, Device, Tensor};
use layers::linear::LinearConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::ModelParams;
use crate::error::ModelError;

/// Projection and normalisation weights of one decoder layer.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    /// `[n_heads * head_dim, dim]`
    pub wq: Tensor,
    /// `[n_kv_heads * head_dim, dim]`
    pub wk: Tensor,
    /// `[n_kv_heads * head_dim, dim]`
    pub wv: Tensor,
    /// `[dim, n_heads * head_dim]`
    pub wo: Tensor,
    /// Gate projection, `[ffn_dim, dim]`.
    pub w1: Tensor,
    /// Down projection, `[dim, ffn_dim]`.
    pub w2: Tensor,
    /// Up projection, `[ffn_dim, dim]`.
    pub w3: Tensor,
    pub attention_norm: Tensor,
    pub ffn_norm: Tensor,
}

impl LayerWeights {
    fn random(params: &ModelParams, rng: &mut StdRng, device: &Device) -> Result<Self, ModelError> {
        let dtype = params.dtype();
        let q_width = params.n_heads * params.head_dim;
        let kv_width = params.n_kv_heads * params.head_dim;
        let mut sample = |input_dim: usize, output_dim: usize| -> Result<Tensor, ModelError> {
            let config = LinearConfig::new(input_dim, output_dim);
            Ok(config.xavier_uniform(&mut *rng, device, dtype)?)
        };
        Ok(Self {
            wq: sample(params.dim, q_width)?,
            wk: sample(params.dim, kv_width)?,
            wv: sample(params.dim, kv_width)?,
            wo: sample(q_width, params.dim)?,
            w1: sample(params.dim, params.ffn_dim)?,
            w2: sample(params.ffn_dim, params.dim)?,
            w3: sample(params.dim, params.ffn_dim)?,
            attention_norm: Tensor::ones(params.dim, dtype, device)?,
            ffn_norm: Tensor::ones(params.dim, dtype, device)?,
        })
    }

    /// Checks every tensor against the shapes implied by `params`.
    pub fn validate(&self, params: &ModelParams, layer: usize) -> Result<(), ModelError> {
        let q_width = params.n_heads * params.head_dim;
        let kv_width = params.n_kv_heads * params.head_dim;
        let expected: [(&str, &Tensor, &[usize]); 9] = [
            ("wq", &self.wq, &[q_width, params.dim]),
            ("wk", &self.wk, &[kv_width, params.dim]),
            ("wv", &self.wv, &[kv_width, params.dim]),
            ("wo", &self.wo, &[params.dim, q_width]),
            ("w1", &self.w1, &[params.ffn_dim, params.dim]),
            ("w2", &self.w2, &[params.dim, params.ffn_dim]),
            ("w3", &self.w3, &[params.ffn_dim, params.dim]),
            ("attention_norm", &self.attention_norm, &[params.dim]),
            ("ffn_norm", &self.ffn_norm, &[params.dim]),
        ];
        for (name, tensor, shape) in expected {
            check_tensor(&format!("layers.{layer}.{name}"), tensor, shape, params.dtype())?;
        }
        Ok(())
    }
}

/// Full decoder weight set.
#[derive(Debug, Clone)]
pub struct XfmrWeights {
    /// `[vocab_size, dim]`
    pub tok_embeddings: Tensor,
    /// Final normalisation, `[dim]`.
    pub norm: Tensor,
    /// Output projection, `[vocab_size, dim]`.
    pub output: Tensor,
    pub layers: Vec<LayerWeights>,
}

impl XfmrWeights {
    /// Xavier-uniform projections and unit norms drawn from a seeded `StdRng`.
    /// The same `(params, seed)` always produces the same weights.
    pub fn random(params: &ModelParams, seed: u64, device: &Device) -> Result<Self, ModelError> {
        params.validate()?;
        let dtype = params.dtype();
        let mut rng = StdRng::seed_from_u64(seed);
        let table = LinearConfig::new(params.dim, params.vocab_size);
        let tok_embeddings = table.xavier_uniform(&mut rng, device, dtype)?;
        let output = table.xavier_uniform(&mut rng, device, dtype)?;
        let layers = (0..params.n_layers)
            .map(|_| LayerWeights::random(params, &mut rng, device))
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!(
            "sampled random weights: seed={} layers={} dtype={:?}",
            seed,
            layers.len(),
            dtype
        );
        Ok(Self {
            tok_embeddings,
            norm: Tensor::ones(params.dim, dtype, device)?,
            output,
            layers,
        })
    }

    /// Checks layer count, shapes and dtypes against `params`.
    pub fn validate(&self, params: &ModelParams) -> Result<(), ModelError> {
        if self.layers.len() != params.n_layers {
            return Err(ModelError::config(format!(
                "expected {} layer weight sets, got {}",
                params.n_layers,
                self.layers.len()
            )));
        }
        let dtype = params.dtype();
        check_tensor(
            "tok_embeddings",
            &self.tok_embeddings,
            &[params.vocab_size, params.dim],
            dtype,
        )?;
        check_tensor("norm", &self.norm, &[params.dim], dtype)?;
        check_tensor("output", &self.output, &[params.vocab_size, params.dim], dtype)?;
        for (index, layer) in self.layers.iter().enumerate() {
            layer.validate(params, index)?;
        }
        Ok(())
    }
}

fn check_tensor(
    name: &str,
    tensor: &Tensor,
    shape: &[usize],
    dtype: DType,
) -> Result<(), ModelError> {
    if tensor.dims() != shape {
        return Err(ModelError::config(format!(
            "{name} expected shape {shape:?}, got {:?}",
            tensor.dims()
        )));
    }
    if tensor.dtype() != dtype {
        return Err(ModelError::config(format!(
            "{name} expected dtype {dtype:?}, got {:?}",
            tensor.dtype()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_weights_match_params_and_seed() -> Result<(), ModelError> {
        let params = ModelParams::tiny();
        let a = XfmrWeights::random(&params, 7, &Device::Cpu)?;
        a.validate(&params)?;
        assert_eq!(a.layers[0].wk.dims(), &[8, 16]);

        let b = XfmrWeights::random(&params, 7, &Device::Cpu)?;
        let diff = (&a.layers[1].w2 - &b.layers[1].w2)?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn mismatched_weights_are_reported() -> Result<(), ModelError> {
        let params = ModelParams::tiny();
        let mut weights = XfmrWeights::random(&params, 1, &Device::Cpu)?;
        weights.layers[1].wv = weights.layers[1].wq.clone();
        let message = weights.validate(&params).unwrap_err().to_string();
        assert!(message.contains("layers.1.wv"), "{message}");

        weights.layers.pop();
        assert!(weights.validate(&params).is_err());
        Ok(())
    }
}
