//! Positional embedding components for the attention stack.
//!
//! The crate hosts rotary positional embeddings: lazily-grown cosine/sine
//! tables, the rotation kernel applied to query/key tensors, and the
//! [`PositionEncoder`](positional::encoder::PositionEncoder) interface the
//! attention crate consumes without knowing which encoding is in play.

pub mod positional;

pub use positional::encoder::{PositionEncoder, RotaryPositionEncoder};
pub use positional::rope::{apply_rotary_pos_emb, RotaryEmbedding};
