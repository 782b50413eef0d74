//! Fully materialised reference kernel.
//!
//! Scores for every query/key pair are computed at once, making this the
//! baseline the chunked kernels are validated against. Peak memory is
//! `O(heads * q_len * k_len)`.

use candle_core::{DType, Result, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::kernels::SdpaKernel;
use crate::masks::effective_mask;

#[derive(Debug, Default, Clone, Copy)]
pub struct MathAttention;

impl SdpaKernel for MathAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        dropout_p: f32,
        is_causal: bool,
    ) -> Result<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        let (_, _, _, v_dim) = v.dims4()?;
        let dtype = q.dtype();
        let merged = batch * heads;
        let scale = 1.0 / (head_dim as f64).sqrt();

        let q_view = q.to_dtype(DType::F32)?.reshape((merged, q_len, head_dim))?;
        let k_view = k.to_dtype(DType::F32)?.reshape((merged, k_len, head_dim))?;
        let scores = q_view
            .matmul(&k_view.transpose(1, 2)?)?
            .affine(scale, 0.0)?
            .reshape((batch, heads, q_len, k_len))?;

        let scores = match effective_mask(mask, is_causal, q_len, k_len, q.device())? {
            Some(m) => scores.broadcast_add(&m)?,
            None => scores,
        };

        let probs = softmax_last_dim(&scores.reshape((merged, q_len, k_len))?)?;
        let probs = if dropout_p > 0.0 {
            dropout(&probs, dropout_p)?
        } else {
            probs
        };

        let v_view = v.to_dtype(DType::F32)?.reshape((merged, k_len, v_dim))?;
        probs
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, v_dim))?
            .to_dtype(dtype)
    }
}
