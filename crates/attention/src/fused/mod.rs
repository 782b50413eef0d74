//! Hardware-specific fused attention dispatch point.
//!
//! Compiled only with the `fused` feature. [`FusedSdpa`] keeps the exact
//! kernel contract of [`SdpaKernel`](crate::kernels::SdpaKernel) so the
//! attention core can swap it in without touching the rest of the pipeline.
//! Accelerator backends hook in here; builds without one route to the
//! key-block streaming kernel.
//!
//! When this path is selected, the core rotates queries and keys from its own
//! cached tables instead of going through the position-encoder interface, so
//! the fused implementation receives fully positioned inputs.

use candle_core::{Result, Tensor};

use crate::kernels::{FlashAttention, SdpaKernel};

#[derive(Debug, Default, Clone, Copy)]
pub struct FusedSdpa {
    inner: FlashAttention,
}

impl SdpaKernel for FusedSdpa {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        dropout_p: f32,
        is_causal: bool,
    ) -> Result<Tensor> {
        log::debug!(
            "fused sdpa on {:?}: no accelerator backend linked, using streaming kernel",
            q.device().location()
        );
        self.inner.attend(q, k, v, mask, dropout_p, is_causal)
    }
}
