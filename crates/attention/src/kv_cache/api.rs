//! Public traits describing key/value cache behaviour.

use candle_core::Tensor;

use crate::core::AttentionError;

/// Cache capable of storing projected keys and values across steps.
pub trait KeyValueCache {
    /// Writes `keys`/`values` (`[batch, step_len, kv_heads, head_dim]`) at
    /// `cur_pos` for `layer` and returns positions `[0, cur_pos + step_len)`
    /// with each kv head repeated `n_rep` times.
    fn update(
        &mut self,
        keys: &Tensor,
        values: &Tensor,
        layer: usize,
        cur_pos: usize,
        n_rep: usize,
    ) -> Result<(Tensor, Tensor), AttentionError>;

    /// Number of committed positions for `layer`.
    fn len(&self, layer: usize) -> usize;

    /// Capacity along the sequence axis.
    fn max_seq_len(&self) -> usize;

    /// Forgets every committed position.
    fn reset(&mut self) -> Result<(), AttentionError>;
}
