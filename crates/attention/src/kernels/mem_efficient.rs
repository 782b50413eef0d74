//! Query-block chunked kernel.
//!
//! Queries are processed in fixed-size blocks; each block runs an exact
//! softmax over the full key range, bounding peak score memory at
//! `block_size * k_len` per head. Per-block dropout on normalised
//! probabilities is equivalent to dropout over the full score matrix.

use candle_core::{DType, Result, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::kernels::SdpaKernel;
use crate::masks::effective_mask;

const DEFAULT_BLOCK_SIZE: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct MemEfficientAttention {
    block_size: usize,
}

impl MemEfficientAttention {
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }
}

impl Default for MemEfficientAttention {
    fn default() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }
}

impl SdpaKernel for MemEfficientAttention {
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
        let k_t = k
            .to_dtype(DType::F32)?
            .reshape((merged, k_len, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v_view = v.to_dtype(DType::F32)?.reshape((merged, k_len, v_dim))?;

        let mask = effective_mask(mask, is_causal, q_len, k_len, q.device())?;

        let mut blocks = Vec::with_capacity(q_len.div_ceil(self.block_size));
        let mut offset = 0;
        while offset < q_len {
            let block = self.block_size.min(q_len - offset);
            let q_block = q_view.narrow(1, offset, block)?;
            let scores = q_block
                .matmul(&k_t)?
                .affine(scale, 0.0)?
                .reshape((batch, heads, block, k_len))?;
            let scores = match &mask {
                Some(m) => {
                    // A mask broadcast over queries needs no slicing.
                    let m_block = if m.dim(2)? == 1 {
                        m.clone()
                    } else {
                        m.narrow(2, offset, block)?
                    };
                    scores.broadcast_add(&m_block)?
                }
                None => scores,
            };
            let probs = softmax_last_dim(&scores.reshape((merged, block, k_len))?)?;
            let probs = if dropout_p > 0.0 {
                dropout(&probs, dropout_p)?
            } else {
                probs
            };
            blocks.push(probs.matmul(&v_view)?);
            offset += block;
        }

        let refs: Vec<&Tensor> = blocks.iter().collect();
        Tensor::cat(&refs, 1)?
            .reshape((batch, heads, q_len, v_dim))?
            .to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::test_support::{build_qkv, max_abs_diff};
    use crate::kernels::MathAttention;
    use candle_core::Device;

    #[test]
    fn block_size_does_not_change_results() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_qkv(&device, 2, 2, 7, 7, 8)?;
        let reference = MathAttention.attend(&q, &k, &v, None, 0.0, true)?;
        for block in [1, 2, 3, 7, 64] {
            let out = MemEfficientAttention::with_block_size(block)
                .attend(&q, &k, &v, None, 0.0, true)?;
            assert!(
                max_abs_diff(&out, &reference)? < 1e-4,
                "block size {block} diverged"
            );
        }
        Ok(())
    }

    #[test]
    fn query_broadcast_mask_is_accepted() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_qkv(&device, 1, 2, 5, 5, 4)?;
        // Padding-style mask broadcast over the query axis.
        let mut data = vec![0f32; 5];
        data[4] = f32::NEG_INFINITY;
        let mask = Tensor::from_vec(data, (1, 1, 1, 5), &device)?;
        let reference = MathAttention.attend(&q, &k, &v, Some(&mask), 0.0, false)?;
        let out = MemEfficientAttention::with_block_size(2)
            .attend(&q, &k, &v, Some(&mask), 0.0, false)?;
        assert!(max_abs_diff(&out, &reference)? < 1e-4);
        Ok(())
    }
}
