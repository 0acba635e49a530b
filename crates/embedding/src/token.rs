//! Token embedding lookup.

use candle_core::{DType, Error, Result, Tensor};

/// Frozen `[vocab, hidden]` embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    vocab_size: usize,
    hidden_dim: usize,
    weight: Tensor,
}

impl TokenEmbedding {
    /// Wraps an existing table shaped `[vocab_size, hidden_dim]`.
    pub fn from_weight(weight: Tensor) -> Result<Self> {
        let (vocab_size, hidden_dim) = weight.dims2()?;
        if vocab_size == 0 || hidden_dim == 0 {
            return Err(Error::Msg(format!(
                "token embedding requires a non-empty table, got [{vocab_size}, {hidden_dim}]"
            )));
        }
        Ok(Self {
            vocab_size,
            hidden_dim,
            weight,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Looks up embeddings for the provided token ids.
    ///
    /// Inputs must be shaped `(batch, seq)` with an integer dtype. Outputs follow the
    /// `(batch, seq, hidden)` layout in the table's dtype.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.validate(token_ids)?;
        let (batch, seq) = token_ids.dims2()?;

        let flat = token_ids.to_dtype(DType::I64)?.flatten_all()?;
        self.ensure_id_range(&flat)?;

        self.weight
            .index_select(&flat, 0)?
            .reshape((batch, seq, self.hidden_dim))
    }

    /// Shape and dtype checks without touching the ids themselves.
    pub fn validate(&self, token_ids: &Tensor) -> Result<()> {
        match token_ids.dims() {
            [batch, seq] if *batch > 0 && *seq > 0 => {}
            [_, _] => {
                return Err(Error::Msg(
                    "token_ids must have non-zero batch and seq dimensions".into(),
                ))
            }
            dims => {
                return Err(Error::Msg(format!(
                    "token_ids must be shaped [batch, seq], got {dims:?}"
                )))
            }
        }

        if token_ids.dtype().is_int() {
            Ok(())
        } else {
            Err(Error::Msg(format!(
                "token_ids expected integer dtype but received {:?}",
                token_ids.dtype()
            )))
        }
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        let min_id = flat_ids.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            return Err(Error::Msg(format!(
                "encountered negative token id {min_id}"
            )));
        }

        let max_id = flat_ids.max_all()?.to_scalar::<i64>()?;
        if max_id >= self.vocab_size as i64 {
            return Err(Error::Msg(format!(
                "token id {} exceeds vocab size {}",
                max_id, self.vocab_size
            )));
        }
        Ok(())
    }
}
