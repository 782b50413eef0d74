//! Rotary positional embedding tables and rotation kernel.
//!
//! [`RotaryEmbedding`] owns precomputed cosine/sine tables shaped
//! `[seq_len, dim]`, where `dim` is the per-head dimension being rotated.
//! Angles follow the standard inverse-frequency formula
//! `inv_freq[i] = base^(-2i/dim)` for `i in [0, dim/2)`, and the frequency
//! block is laid out twice along the embedding axis before taking cos/sin, so
//! rotation pairs dimension `j` with dimension `j + dim/2`.
//!
//! Tables grow monotonically: requesting a longer sequence regenerates the
//! table at the new length, while covered requests slice the stored tensors
//! without recomputation. Growth is prefix-stable, so cached rows never change
//! value once produced. Storage stays in `f32`; callers receive views cast to
//! their working dtype.

use std::sync::Mutex;

use candle_core::{bail, DType, Device, Result, Tensor};

/// Default base angle for the rotary frequency spectrum.
pub const DEFAULT_ROPE_BASE: f64 = 10_000.0;

#[derive(Debug)]
struct Tables {
    coverage: usize,
    cos: Tensor,
    sin: Tensor,
}

/// Precomputed rotary tables with monotonic, lazily-grown coverage.
#[derive(Debug)]
pub struct RotaryEmbedding {
    dim: usize,
    inv_freq: Vec<f64>,
    device: Device,
    tables: Mutex<Option<Tables>>,
}

impl RotaryEmbedding {
    /// Build the embedding for a per-head dimension and base angle.
    pub fn new(dim: usize, base: f64, device: Device) -> Result<Self> {
        if dim == 0 || dim % 2 != 0 {
            bail!("rotary dim must be a non-zero even number, got {dim}");
        }
        let half = dim / 2;
        let mut inv_freq = Vec::with_capacity(half);
        for idx in 0..half {
            let exponent = (2 * idx) as f64 / dim as f64;
            inv_freq.push(base.powf(-exponent));
        }
        Ok(Self {
            dim,
            inv_freq,
            device,
            tables: Mutex::new(None),
        })
    }

    /// Per-head dimension covered by the rotation.
    pub fn dim(&self) -> usize {
        self.dim
    }

    fn build_tables(&self, seq_len: usize) -> Result<Tables> {
        let half = self.dim / 2;
        let mut cos_data = Vec::with_capacity(seq_len * self.dim);
        let mut sin_data = Vec::with_capacity(seq_len * self.dim);
        for pos in 0..seq_len {
            let pos_f = pos as f64;
            // Column j and column j + half share the same frequency.
            for col in 0..self.dim {
                let angle = pos_f * self.inv_freq[col % half];
                cos_data.push(angle.cos() as f32);
                sin_data.push(angle.sin() as f32);
            }
        }
        let cos = Tensor::from_vec(cos_data, (seq_len, self.dim), &self.device)?;
        let sin = Tensor::from_vec(sin_data, (seq_len, self.dim), &self.device)?;
        Ok(Tables {
            coverage: seq_len,
            cos,
            sin,
        })
    }

    /// Fetch `(cos, sin)` tables truncated to `seq_len` rows, cast to `dtype`.
    ///
    /// Regenerates the stored tables only when `seq_len` exceeds the current
    /// coverage; coverage never shrinks.
    pub fn get(&self, seq_len: usize, dtype: DType) -> Result<(Tensor, Tensor)> {
        let mut guard = self
            .tables
            .lock()
            .map_err(|_| candle_core::Error::Msg("rotary table lock poisoned".into()))?;
        let needs_grow = guard
            .as_ref()
            .map(|t| t.coverage < seq_len)
            .unwrap_or(true);
        if needs_grow {
            log::debug!(
                "rotary table regrow: dim={} coverage {} -> {}",
                self.dim,
                guard.as_ref().map(|t| t.coverage).unwrap_or(0),
                seq_len
            );
            *guard = Some(self.build_tables(seq_len)?);
        }
        let tables = guard.as_ref().expect("tables present after growth");
        let cos = tables.cos.narrow(0, 0, seq_len)?.to_dtype(dtype)?;
        let sin = tables.sin.narrow(0, 0, seq_len)?.to_dtype(dtype)?;
        Ok((cos, sin))
    }

    /// Gather `(cos, sin)` rows for explicit positions, cast to `dtype`.
    ///
    /// `positions` is a 1-D `u32` tensor; coverage grows to include the
    /// largest requested position.
    pub fn select(&self, positions: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let pos_vec = positions.to_vec1::<u32>()?;
        let needed = pos_vec.iter().copied().max().map_or(0, |m| m as usize + 1);
        let (cos, sin) = self.get(needed, dtype)?;
        let indices = positions.to_device(cos.device())?;
        let cos_rows = cos.index_select(&indices, 0)?;
        let sin_rows = sin.index_select(&indices, 0)?;
        Ok((cos_rows, sin_rows))
    }
}

fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last = x.rank() - 1;
    let size = x.dim(last)?;
    let half = size / 2;
    let x1 = x.narrow(last, 0, half)?;
    let x2 = x.narrow(last, half, size - half)?;
    Tensor::cat(&[&x2.neg()?, &x1], last)
}

/// Rotate one tensor by position-dependent angles.
///
/// Computes `x * cos + rotate_half(x) * sin` on the last axis. `cos` and
/// `sin` must already be shaped for broadcasting against `x`: callers working
/// in the projection layout `[batch, seq, heads, dim]` reshape the selected
/// rows to `[1, seq, 1, dim]`, the head-major layout `[batch, heads, seq,
/// dim]` uses `[1, 1, seq, dim]`. Output dtype mirrors the input.
pub fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    x.broadcast_mul(cos)?
        .add(&rotate_half(x)?.broadcast_mul(sin)?)
}

/// Rotate a query/key pair sharing one set of tables.
pub fn apply_rotary_pos_emb(
    q: &Tensor,
    k: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
) -> Result<(Tensor, Tensor)> {
    Ok((apply_rotary(q, cos, sin)?, apply_rotary(k, cos, sin)?))
}
