//! Key-block streaming kernel with online softmax.
//!
//! Keys and values are consumed in fixed-size blocks while a running maximum,
//! normaliser, and output accumulator are rescaled per block, so the full
//! score matrix is never materialised. Dropout needs the normalised
//! probability matrix, so calls with a non-zero probability route to the
//! exact kernel.

use candle_core::{DType, Result, Tensor};

use crate::kernels::{MathAttention, SdpaKernel};
use crate::masks::effective_mask;

const DEFAULT_BLOCK_SIZE: usize = 128;

// Finite stand-in for -inf: keeps rescaling factors well-defined when a whole
// block is masked out.
const RUNNING_MAX_FLOOR: f32 = -1e30;

#[derive(Debug, Clone, Copy)]
pub struct FlashAttention {
    block_size: usize,
}

impl FlashAttention {
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }
}

impl Default for FlashAttention {
    fn default() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }
}

impl SdpaKernel for FlashAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        dropout_p: f32,
        is_causal: bool,
    ) -> Result<Tensor> {
        if dropout_p > 0.0 {
            return MathAttention.attend(q, k, v, mask, dropout_p, is_causal);
        }

        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        let (_, _, _, v_dim) = v.dims4()?;
        let dtype = q.dtype();
        let device = q.device();
        let merged = batch * heads;
        let scale = 1.0 / (head_dim as f64).sqrt();

        let q_view = q.to_dtype(DType::F32)?.reshape((merged, q_len, head_dim))?;
        let k_view = k.to_dtype(DType::F32)?.reshape((merged, k_len, head_dim))?;
        let v_view = v.to_dtype(DType::F32)?.reshape((merged, k_len, v_dim))?;

        let mask = match effective_mask(mask, is_causal, q_len, k_len, device)? {
            Some(m) => Some(
                m.broadcast_as((batch, heads, q_len, k_len))?
                    .contiguous()?
                    .reshape((merged, q_len, k_len))?,
            ),
            None => None,
        };

        let mut running_max = Tensor::full(RUNNING_MAX_FLOOR, (merged, q_len, 1), device)?;
        let mut normaliser = Tensor::zeros((merged, q_len, 1), DType::F32, device)?;
        let mut acc = Tensor::zeros((merged, q_len, v_dim), DType::F32, device)?;

        let mut offset = 0;
        while offset < k_len {
            let block = self.block_size.min(k_len - offset);
            let k_block = k_view.narrow(1, offset, block)?;
            let v_block = v_view.narrow(1, offset, block)?;

            let mut scores = q_view
                .matmul(&k_block.transpose(1, 2)?.contiguous()?)?
                .affine(scale, 0.0)?;
            if let Some(m) = &mask {
                scores = scores.add(&m.narrow(2, offset, block)?)?;
            }

            let block_max = scores.max_keepdim(2)?;
            let new_max = running_max.maximum(&block_max)?;
            let rescale = running_max.sub(&new_max)?.exp()?;
            let probs = scores.broadcast_sub(&new_max)?.exp()?;

            normaliser = normaliser.mul(&rescale)?.add(&probs.sum_keepdim(2)?)?;
            acc = acc
                .broadcast_mul(&rescale)?
                .add(&probs.matmul(&v_block)?)?;
            running_max = new_max;
            offset += block;
        }

        acc.broadcast_div(&normaliser)?
            .reshape((batch, heads, q_len, v_dim))?
            .to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::test_support::{build_qkv, max_abs_diff};
    use candle_core::Device;

    #[test]
    fn streaming_matches_exact_softmax() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_qkv(&device, 2, 2, 6, 9, 8)?;
        let reference = MathAttention.attend(&q, &k, &v, None, 0.0, true)?;
        for block in [1, 2, 4, 9, 128] {
            let out =
                FlashAttention::with_block_size(block).attend(&q, &k, &v, None, 0.0, true)?;
            assert!(
                max_abs_diff(&out, &reference)? < 1e-4,
                "block size {block} diverged"
            );
        }
        Ok(())
    }

    #[test]
    fn fully_masked_leading_block_recovers() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_qkv(&device, 1, 1, 2, 6, 4)?;
        // Hide the first three keys entirely; a block size of 3 makes the
        // whole first block masked.
        let mut data = vec![0f32; 2 * 6];
        for row in 0..2 {
            for col in 0..3 {
                data[row * 6 + col] = f32::NEG_INFINITY;
            }
        }
        let mask = Tensor::from_vec(data, (1, 1, 2, 6), &device)?;
        let reference = MathAttention.attend(&q, &k, &v, Some(&mask), 0.0, false)?;
        let out =
            FlashAttention::with_block_size(3).attend(&q, &k, &v, Some(&mask), 0.0, false)?;
        assert!(max_abs_diff(&out, &reference)? < 1e-4);
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|value| value.is_finite()));
        Ok(())
    }

    #[test]
    fn dropout_routes_to_exact_kernel_shape() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_qkv(&device, 1, 2, 4, 4, 8)?;
        let out = FlashAttention::default().attend(&q, &k, &v, None, 0.5, false)?;
        assert_eq!(out.dims(), &[1, 2, 4, 8]);
        Ok(())
    }
}
