//! Additive attention mask helpers.
//!
//! Masks are additive `f32` tensors broadcastable to
//! `[batch, heads, q_len, k_len]`: `0.0` keeps a position, `f32::NEG_INFINITY`
//! discards it. Kernels accumulate scores in `f32`, so masks stay in `f32`
//! regardless of the activation dtype.

pub mod causal;

use candle_core::{bail, DType, Device, Result, Tensor};

pub use causal::build_causal_mask;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Bring a caller-supplied mask to the broadcastable 4-D layout.
///
/// Accepts `[q_len, k_len]`, `[batch, q_len, k_len]`, or an already 4-D
/// `[batch, heads|1, q_len, k_len]` tensor; singleton axes are inserted on the
/// left of the missing dimensions.
pub fn normalize_mask(mask: &Tensor) -> Result<Tensor> {
    match mask.rank() {
        4 => Ok(mask.clone()),
        3 => mask.unsqueeze(1),
        2 => mask.unsqueeze(0)?.unsqueeze(1),
        rank => bail!("mask must have rank 2..=4, got rank {rank}"),
    }
}

/// Combine an optional additive mask with an optional causal constraint.
///
/// Returns `None` when neither applies. The result is `f32` and broadcastable
/// against `[batch, heads, q_len, k_len]` scores.
pub fn effective_mask(
    mask: Option<&Tensor>,
    is_causal: bool,
    q_len: usize,
    k_len: usize,
    device: &Device,
) -> Result<Option<Tensor>> {
    let user = match mask {
        Some(m) => Some(m.to_dtype(MASK_DTYPE)?),
        None => None,
    };
    if !is_causal {
        return Ok(user);
    }
    let causal = build_causal_mask(device, q_len, k_len)?;
    match user {
        Some(m) => Ok(Some(m.broadcast_add(&causal)?)),
        None => Ok(Some(causal)),
    }
}
