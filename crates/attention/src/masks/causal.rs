//! Builder for additive causal masks.

use candle_core::{Device, Result, Tensor};

/// Construct a `[1, 1, q_len, k_len]` causal mask.
///
/// When `k_len > q_len` the queries are assumed to align with the most recent
/// `q_len` keys, so a cached prefix stays fully visible to every query.
pub fn build_causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let mut data = vec![0f32; q_len * k_len];
    for q in 0..q_len {
        for k in (q + offset + 1)..k_len {
            data[q * k_len + k] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(data, (1, 1, q_len, k_len), device)
}
