//! Position encoder interface consumed by attention layers.
//!
//! Attention cores call [`PositionEncoder::adjusted_qk`] on freshly projected
//! queries and keys, before any cache concatenation, and
//! [`PositionEncoder::adjusted_mask`] once the attention mask has been
//! normalised. Encoders that rotate representations (RoPE) implement the
//! first hook and pass masks through; additive-bias schemes would do the
//! opposite.

use candle_core::{bail, Result, Tensor};

use crate::positional::rope::{apply_rotary, RotaryEmbedding};

/// Hooks letting an attention layer defer position handling to an encoder.
pub trait PositionEncoder: std::fmt::Debug + Send + Sync {
    /// Adjust freshly computed queries and keys for their positions.
    ///
    /// `q` and `k` use the projection layout `[batch, seq, heads, head_dim]`;
    /// `past` is the caller-held `(keys, values)` cache pair in head-major
    /// layout `[batch, kv_heads, seq_so_far, head_dim]`, when one exists.
    /// `position_ids` is an optional 1-D `u32` tensor; when absent, positions
    /// default to the contiguous range starting at the past-cache length.
    fn adjusted_qk(
        &self,
        q: &Tensor,
        k: &Tensor,
        position_ids: Option<&Tensor>,
        past: Option<(&Tensor, &Tensor)>,
        use_cache: bool,
    ) -> Result<(Tensor, Tensor)>;

    /// Adjust the attention mask, e.g. to fold in positional biases.
    ///
    /// `q` and `k` here are the head-major tensors entering the kernel.
    fn adjusted_mask(
        &self,
        mask: Option<&Tensor>,
        q: &Tensor,
        k: &Tensor,
        past: Option<(&Tensor, &Tensor)>,
        use_cache: bool,
    ) -> Result<Option<Tensor>>;
}

/// Length of the cached sequence, treating empty tensors as absent.
pub fn past_length(past: Option<(&Tensor, &Tensor)>) -> Result<usize> {
    match past {
        Some((keys, _)) if keys.elem_count() > 0 => keys.dim(2),
        _ => Ok(0),
    }
}

/// Rotary implementation of [`PositionEncoder`].
#[derive(Debug)]
pub struct RotaryPositionEncoder {
    rope: RotaryEmbedding,
}

impl RotaryPositionEncoder {
    pub fn new(rope: RotaryEmbedding) -> Self {
        Self { rope }
    }

    /// Access the underlying rotary tables.
    pub fn rope(&self) -> &RotaryEmbedding {
        &self.rope
    }

    fn rotate(&self, x: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len, _heads, head_dim) = x.dims4()?;
        let (cos, sin) = self.rope.select(positions, x.dtype())?;
        let cos = cos.reshape((1, seq_len, 1, head_dim))?;
        let sin = sin.reshape((1, seq_len, 1, head_dim))?;
        apply_rotary(x, &cos, &sin)
    }
}

impl PositionEncoder for RotaryPositionEncoder {
    fn adjusted_qk(
        &self,
        q: &Tensor,
        k: &Tensor,
        position_ids: Option<&Tensor>,
        past: Option<(&Tensor, &Tensor)>,
        use_cache: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (_batch, q_len, _heads, head_dim) = q.dims4()?;
        let k_len = k.dim(1)?;
        if head_dim != self.rope.dim() || k.dim(3)? != self.rope.dim() {
            bail!(
                "rotary dim {} does not match query/key head dim",
                self.rope.dim()
            );
        }

        let start = if use_cache { past_length(past)? } else { 0 } as u32;
        let (q_pos, k_pos) = match position_ids {
            Some(ids) => {
                if ids.rank() != 1 || ids.dim(0)? != q_len || q_len != k_len {
                    bail!(
                        "explicit position ids must be 1-D of length {q_len} with matching query/key lengths"
                    );
                }
                (ids.clone(), ids.clone())
            }
            None => (
                Tensor::arange(start, start + q_len as u32, q.device())?,
                Tensor::arange(start, start + k_len as u32, k.device())?,
            ),
        };

        Ok((self.rotate(q, &q_pos)?, self.rotate(k, &k_pos)?))
    }

    fn adjusted_mask(
        &self,
        mask: Option<&Tensor>,
        _q: &Tensor,
        _k: &Tensor,
        _past: Option<(&Tensor, &Tensor)>,
        _use_cache: bool,
    ) -> Result<Option<Tensor>> {
        // Rotation carries no additive bias; the mask is untouched.
        Ok(mask.cloned())
    }
}
