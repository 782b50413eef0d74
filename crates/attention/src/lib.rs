//! Multi-head attention with grouped key/value heads and tensor parallelism.
//!
//! The crate is built around two layered components. The
//! [`MultiHeadAttention`](mha::MultiHeadAttention) core owns the four
//! projections, optional rotary position handling, the incremental key/value
//! cache contract, grouped-KV expansion, and dispatch to one of several
//! interchangeable scaled-dot-product kernels. The
//! [`TpMultiHeadAttention`](tp::TpMultiHeadAttention) wrapper composes a core
//! over a head partition, sharding parameters across cooperating workers and
//! sum-reducing the output through an opaque collective.
//!
//! Inputs to the core are `[batch, seq, emb_dim]`; kernels operate on
//! head-major `[batch, heads, seq, head_dim]` tensors. Shape and numeric
//! failures surface as `candle_core::Error` from forward passes; construction
//! and weight loading report [`AttentionError`](core::errors::AttentionError).

pub mod cache;
pub mod core;
pub mod kernels;
pub mod masks;
pub mod mha;
pub mod tp;

#[cfg(feature = "fused")]
pub mod fused;

pub use crate::core::{AttentionConfig, AttentionError};
pub use cache::KeyValueCache;
pub use kernels::{AttnAlgorithm, SdpaKernel};
pub use mha::{ForwardParams, MultiHeadAttention, ProjectionRole};
pub use tp::{Collective, PartitionDescriptor, SingleWorker, TpMultiHeadAttention};
