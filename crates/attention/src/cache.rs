//! Caller-owned key/value cache for incremental decoding.
//!
//! The cache is a pair of tensors shaped
//! `[batch, kv_heads, seq_len_so_far, head_dim]`. The attention core never
//! owns one: it reads the reference it is given and hands back a grown
//! (self-attention) or reused (cross-attention) cache for the caller to carry
//! into the next decode step. Keys and values are stored at key/value-head
//! granularity, before any grouped-query expansion, which keeps tensor-parallel
//! shards consistent across steps.

use candle_core::{Result, Tensor};

/// Incremental `(keys, values)` cache for one attention layer.
#[derive(Debug, Clone)]
pub struct KeyValueCache {
    pub keys: Tensor,
    pub values: Tensor,
}

impl KeyValueCache {
    pub fn new(keys: Tensor, values: Tensor) -> Self {
        Self { keys, values }
    }

    /// Number of cached sequence positions.
    pub fn seq_len(&self) -> Result<usize> {
        self.keys.dim(2)
    }

    /// An empty cache behaves as if no cache were supplied at all.
    pub fn is_empty(&self) -> bool {
        self.keys.elem_count() == 0
    }

    /// Borrow the underlying pair, e.g. for the position-encoder interface.
    pub fn as_pair(&self) -> (&Tensor, &Tensor) {
        (&self.keys, &self.values)
    }

    /// Grow the cache by concatenating fresh keys/values on the sequence axis.
    pub fn concat(&self, keys: &Tensor, values: &Tensor) -> Result<Self> {
        Ok(Self {
            keys: Tensor::cat(&[&self.keys, keys], 2)?,
            values: Tensor::cat(&[&self.values, values], 2)?,
        })
    }
}
