//! Interchangeable scaled-dot-product attention kernels.
//!
//! Every kernel implements [`SdpaKernel`] over head-major
//! `[batch, heads, seq, head_dim]` tensors and must produce the same result up
//! to numerical tolerance; they differ only in how scores are materialised.
//! Callers pick a kernel per call through [`AttnAlgorithm`] — there is no
//! process-wide backend toggle. With no hint, [`dispatch`] selects the
//! memory-efficient path.
//!
//! Reductions accumulate in `f32` regardless of the activation dtype, and the
//! output mirrors the dtype of `q`.

pub mod flash;
pub mod math;
pub mod mem_efficient;

use candle_core::{Result, Tensor};

pub use flash::FlashAttention;
pub use math::MathAttention;
pub use mem_efficient::MemEfficientAttention;

/// Uniform kernel interface.
///
/// `q`/`k` share a head dimension; `v` may use a different one, and the output
/// is `[batch, heads, q_len, v_head_dim]`. `dropout_p` is the already-gated
/// probability: the core passes `0.0` outside training. `is_causal` folds a
/// causal constraint into the mask, aligning queries with the most recent
/// keys when a cached prefix makes `k_len > q_len`.
pub trait SdpaKernel: Send + Sync {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        dropout_p: f32,
        is_causal: bool,
    ) -> Result<Tensor>;
}

/// Caller-supplied kernel selection hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttnAlgorithm {
    /// Key-block streaming with online softmax.
    Flash,
    /// Query-block chunking with exact per-block softmax.
    MemEfficient,
    /// Fully materialised reference implementation.
    Math,
    /// Hardware-specific fused path (requires the `fused` feature).
    #[cfg(feature = "fused")]
    Fused,
}

/// Map a selection hint to a kernel instance.
pub fn dispatch(hint: Option<AttnAlgorithm>) -> Box<dyn SdpaKernel> {
    log::debug!("sdpa dispatch: hint={hint:?}");
    match hint {
        Some(AttnAlgorithm::Flash) => Box::new(FlashAttention::default()),
        Some(AttnAlgorithm::Math) => Box::new(MathAttention),
        Some(AttnAlgorithm::MemEfficient) | None => Box::new(MemEfficientAttention::default()),
        #[cfg(feature = "fused")]
        Some(AttnAlgorithm::Fused) => Box::new(crate::fused::FusedSdpa::default()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use candle_core::{DType, Device, Result, Tensor};

    pub fn build_qkv(
        device: &Device,
        batch: usize,
        heads: usize,
        q_len: usize,
        k_len: usize,
        head_dim: usize,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let q_total = batch * heads * q_len * head_dim;
        let kv_total = batch * heads * k_len * head_dim;
        let q_data: Vec<f32> = (0..q_total).map(|i| ((i % 13) as f32) * 0.07 - 0.4).collect();
        let k_data: Vec<f32> = (0..kv_total).map(|i| ((i % 11) as f32) * 0.05 - 0.2).collect();
        let v_data: Vec<f32> = (0..kv_total).map(|i| ((i % 7) as f32) * 0.11 - 0.3).collect();
        let q = Tensor::from_vec(q_data, (batch, heads, q_len, head_dim), device)?;
        let k = Tensor::from_vec(k_data, (batch, heads, k_len, head_dim), device)?;
        let v = Tensor::from_vec(v_data, (batch, heads, k_len, head_dim), device)?;
        Ok((q, k, v))
    }

    pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }
}
