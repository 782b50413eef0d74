//! Multi-headed self- and cross-attention core.
//!
//! The core owns the query/key/value/output projections and orchestrates the
//! forward pipeline: project, rotate (before any caching), merge the
//! incremental key/value cache, normalise the mask, expand grouped KV heads,
//! run one scaled-dot-product kernel, and project the result back to the
//! embedding dimension. No state persists across calls inside the core
//! itself; decode-time state lives entirely in the caller-held
//! [`KeyValueCache`].

use std::sync::Arc;

use candle_core::{bail, DType, Device, Result, Tensor};
use candle_nn::{Linear, Module};
use embedding::positional::encoder::{past_length, PositionEncoder};
use embedding::positional::rope::{apply_rotary_pos_emb, RotaryEmbedding, DEFAULT_ROPE_BASE};

use crate::cache::KeyValueCache;
use crate::core::{AttentionConfig, AttentionError};
use crate::kernels::{dispatch, AttnAlgorithm};
use crate::masks::normalize_mask;

/// Per-call options threaded through [`MultiHeadAttention::forward`].
///
/// Kernel selection, causality, and train-mode dropout are all explicit here;
/// nothing is toggled through process-wide state.
#[derive(Debug, Clone, Copy)]
pub struct ForwardParams<'a> {
    /// Additive attention mask, rank 2 to 4; normalised internally.
    pub mask: Option<&'a Tensor>,
    /// Explicit 1-D `u32` token positions for rotary encoding.
    pub position_ids: Option<&'a Tensor>,
    /// Kernel hint; `None` lets the dispatcher pick the default.
    pub algorithm: Option<AttnAlgorithm>,
    /// Cache carried over from the previous decode step.
    pub past_key_value: Option<&'a KeyValueCache>,
    /// Return an updated cache alongside the output.
    pub use_cache: bool,
    /// Self-attention (true) or cross-attention (false).
    pub is_self: bool,
    /// Apply a causal constraint inside the kernel.
    pub is_causal: bool,
    /// Enables dropout at the configured probability.
    pub training: bool,
}

impl Default for ForwardParams<'_> {
    fn default() -> Self {
        Self {
            mask: None,
            position_ids: None,
            algorithm: None,
            past_key_value: None,
            use_cache: false,
            is_self: true,
            is_causal: false,
            training: false,
        }
    }
}

/// Identifies one of the four projections for weight installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionRole {
    Query,
    Key,
    Value,
    Dense,
}

impl ProjectionRole {
    /// Checkpoint key component for this projection.
    pub fn name(&self) -> &'static str {
        match self {
            ProjectionRole::Query => "query",
            ProjectionRole::Key => "key",
            ProjectionRole::Value => "value",
            ProjectionRole::Dense => "dense",
        }
    }
}

/// Attention core with optional rotary position handling and grouped KV heads.
pub struct MultiHeadAttention {
    config: AttentionConfig,
    query: Linear,
    key: Linear,
    value: Linear,
    dense: Linear,
    position_encoder: Option<Arc<dyn PositionEncoder>>,
    // Tables for the fused path, which rotates without going through the
    // encoder interface.
    rotary: Option<RotaryEmbedding>,
    device: Device,
    dtype: DType,
}

impl std::fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("config", &self.config)
            .field("has_position_encoder", &self.position_encoder.is_some())
            .field("dtype", &self.dtype)
            .finish()
    }
}

fn init_linear(
    input_dim: usize,
    output_dim: usize,
    use_bias: bool,
    device: &Device,
    dtype: DType,
) -> Result<Linear> {
    let weight = Tensor::randn(0f32, 0.02, (output_dim, input_dim), device)?.to_dtype(dtype)?;
    let bias = if use_bias {
        Some(Tensor::zeros(output_dim, dtype, device)?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

impl MultiHeadAttention {
    /// Build the core with freshly initialised projections.
    pub fn new(
        config: AttentionConfig,
        position_encoder: Option<Arc<dyn PositionEncoder>>,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, AttentionError> {
        let query = init_linear(
            config.emb_dim,
            config.nheads * config.emb_kq_per_head,
            config.use_bias,
            device,
            dtype,
        )?;
        let key = init_linear(
            config.emb_dim,
            config.kvheads * config.emb_kq_per_head,
            config.use_bias,
            device,
            dtype,
        )?;
        let value = init_linear(
            config.emb_dim,
            config.kvheads * config.emb_v_per_head,
            config.use_bias,
            device,
            dtype,
        )?;
        let dense = init_linear(
            config.nheads * config.emb_v_per_head,
            config.emb_dim,
            config.use_bias,
            device,
            dtype,
        )?;

        let rotary = if position_encoder.is_some() {
            Some(RotaryEmbedding::new(
                config.emb_kq_per_head,
                DEFAULT_ROPE_BASE,
                device.clone(),
            )?)
        } else {
            None
        };

        log::info!(
            "attention core init: emb_dim={} nheads={} kvheads={} emb_kq={} emb_v={} bias={} encoder={}",
            config.emb_dim,
            config.nheads,
            config.kvheads,
            config.emb_kq_per_head,
            config.emb_v_per_head,
            config.use_bias,
            position_encoder.is_some(),
        );

        Ok(Self {
            config,
            query,
            key,
            value,
            dense,
            position_encoder,
            rotary,
            device: device.clone(),
            dtype,
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn expected_weight_shape(&self, role: ProjectionRole) -> (usize, usize) {
        let cfg = &self.config;
        match role {
            ProjectionRole::Query => (cfg.nheads * cfg.emb_kq_per_head, cfg.emb_dim),
            ProjectionRole::Key => (cfg.kvheads * cfg.emb_kq_per_head, cfg.emb_dim),
            ProjectionRole::Value => (cfg.kvheads * cfg.emb_v_per_head, cfg.emb_dim),
            ProjectionRole::Dense => (cfg.emb_dim, cfg.nheads * cfg.emb_v_per_head),
        }
    }

    fn prepare_projection(
        &self,
        role: ProjectionRole,
        weight: Tensor,
        bias: Option<Tensor>,
    ) -> std::result::Result<Linear, AttentionError> {
        let expected = self.expected_weight_shape(role);
        let dims = weight.dims();
        if dims != [expected.0, expected.1] {
            return Err(AttentionError::Config {
                context: format!(
                    "{} weight expects shape {:?}, got {:?}",
                    role.name(),
                    [expected.0, expected.1],
                    dims
                ),
            });
        }
        if self.config.use_bias != bias.is_some() {
            return Err(AttentionError::Config {
                context: format!(
                    "{} bias presence does not match use_bias={}",
                    role.name(),
                    self.config.use_bias
                ),
            });
        }
        let weight = weight.to_dtype(self.dtype)?;
        let bias = match bias {
            Some(b) => {
                if b.dims() != [expected.0] {
                    return Err(AttentionError::Config {
                        context: format!(
                            "{} bias expects shape [{}], got {:?}",
                            role.name(),
                            expected.0,
                            b.dims()
                        ),
                    });
                }
                Some(b.to_dtype(self.dtype)?)
            }
            None => None,
        };
        Ok(Linear::new(weight, bias))
    }

    fn install_projection(&mut self, role: ProjectionRole, layer: Linear) {
        match role {
            ProjectionRole::Query => self.query = layer,
            ProjectionRole::Key => self.key = layer,
            ProjectionRole::Value => self.value = layer,
            ProjectionRole::Dense => self.dense = layer,
        }
    }

    /// Install a projection's parameters, replacing the current ones.
    ///
    /// Used at load time only; forward passes never mutate the projections.
    pub fn set_projection(
        &mut self,
        role: ProjectionRole,
        weight: Tensor,
        bias: Option<Tensor>,
    ) -> std::result::Result<(), AttentionError> {
        let layer = self.prepare_projection(role, weight, bias)?;
        self.install_projection(role, layer);
        Ok(())
    }

    /// Validate a batch of projections, then install them all.
    ///
    /// Nothing is replaced until every entry has passed validation, so a
    /// failure leaves the layer exactly as it was.
    pub fn set_projections(
        &mut self,
        entries: Vec<(ProjectionRole, Tensor, Option<Tensor>)>,
    ) -> std::result::Result<(), AttentionError> {
        let mut prepared = Vec::with_capacity(entries.len());
        for (role, weight, bias) in entries {
            prepared.push((role, self.prepare_projection(role, weight, bias)?));
        }
        for (role, layer) in prepared {
            self.install_projection(role, layer);
        }
        Ok(())
    }

    fn rotate_fused(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        params: &ForwardParams,
        past: Option<&KeyValueCache>,
    ) -> Result<(Tensor, Tensor)> {
        let rotary = match &self.rotary {
            Some(r) => r,
            None => return Ok((queries.clone(), keys.clone())),
        };
        // Head-major layout here: [batch, heads, seq, head_dim].
        let (_b, _h, q_len, head_dim) = queries.dims4()?;
        let k_len = keys.dim(2)?;
        let start = if params.use_cache {
            past_length(past.map(|c| c.as_pair()))?
        } else {
            0
        } as u32;
        let positions = match params.position_ids {
            Some(ids) => ids.clone(),
            None => Tensor::arange(start, start + k_len as u32, queries.device())?,
        };
        if positions.rank() != 1 || positions.dim(0)? != k_len || q_len != k_len {
            bail!("fused rotation expects 1-D positions matching the sequence length");
        }
        let (cos, sin) = rotary.select(&positions, queries.dtype())?;
        let cos = cos.reshape((1, 1, k_len, head_dim))?;
        let sin = sin.reshape((1, 1, k_len, head_dim))?;
        apply_rotary_pos_emb(queries, keys, &cos, &sin)
    }

    /// Run the attention pipeline.
    ///
    /// `q_src`, `k_src`, and `v_src` are `[batch, seq, emb_dim]`; for
    /// self-attention all three are the same tensor. Returns the projected
    /// output `[batch, q_seq, emb_dim]` and, when `params.use_cache`, the
    /// updated cache at key/value-head granularity.
    pub fn forward(
        &self,
        q_src: &Tensor,
        k_src: &Tensor,
        v_src: &Tensor,
        params: &ForwardParams,
    ) -> Result<(Tensor, Option<KeyValueCache>)> {
        let cfg = &self.config;
        let (batch, q_len, _) = q_src.dims3()?;
        let kv_len = k_src.dim(1)?;

        // An empty cache behaves exactly like a missing one.
        let past = params.past_key_value.filter(|cache| !cache.is_empty());
        let past_pair = past.map(|cache| cache.as_pair());

        #[cfg(feature = "fused")]
        let fused = matches!(params.algorithm, Some(AttnAlgorithm::Fused));
        #[cfg(not(feature = "fused"))]
        let fused = false;

        let mut queries = self
            .query
            .forward(q_src)?
            .reshape((batch, q_len, cfg.nheads, cfg.emb_kq_per_head))?;

        // Self-attention always recomputes keys/values; cross-attention only
        // does so when no cache exists yet.
        let mut fresh = if params.is_self || past.is_none() {
            let keys = self
                .key
                .forward(k_src)?
                .reshape((batch, kv_len, cfg.kvheads, cfg.emb_kq_per_head))?;
            let values = self
                .value
                .forward(v_src)?
                .reshape((batch, kv_len, cfg.kvheads, cfg.emb_v_per_head))?;
            Some((keys, values))
        } else {
            None
        };

        // Rotation happens before the cache merge and before KV expansion.
        if !fused {
            if let (Some(encoder), Some((keys, _))) = (&self.position_encoder, &fresh) {
                let (q_rot, k_rot) = encoder.adjusted_qk(
                    &queries,
                    keys,
                    params.position_ids,
                    past_pair,
                    params.use_cache,
                )?;
                queries = q_rot;
                fresh = fresh.map(|(_, values)| (k_rot.clone(), values));
            }
        }

        let mut queries = queries.transpose(1, 2)?.contiguous()?;
        let mut fresh = match fresh {
            Some((keys, values)) => Some((
                keys.transpose(1, 2)?.contiguous()?,
                values.transpose(1, 2)?.contiguous()?,
            )),
            None => None,
        };

        if fused {
            if let Some((keys, values)) = fresh.take() {
                let (q_rot, k_rot) = self.rotate_fused(&queries, &keys, params, past)?;
                queries = q_rot;
                fresh = Some((k_rot, values));
            }
        }

        let (keys, values) = match (fresh, past) {
            (Some((keys, values)), Some(cache)) if params.use_cache => {
                if params.is_self {
                    let grown = cache.concat(&keys, &values)?;
                    (grown.keys, grown.values)
                } else {
                    // Cross-attention cache is frozen after its first
                    // computation; the fresh pair is discarded.
                    (cache.keys.clone(), cache.values.clone())
                }
            }
            (Some((keys, values)), _) => (keys, values),
            (None, Some(cache)) => (cache.keys.clone(), cache.values.clone()),
            (None, None) => unreachable!("keys are always computed when no cache exists"),
        };

        let mask = match params.mask {
            Some(mask) => Some(normalize_mask(mask)?),
            None => None,
        };
        let mask = match (&self.position_encoder, fused) {
            (Some(encoder), false) => encoder.adjusted_mask(
                mask.as_ref(),
                &queries,
                &keys,
                past_pair,
                params.use_cache,
            )?,
            _ => mask,
        };

        let (keys_e, values_e) = expand_kv(&keys, &values, cfg.expansion())?;

        let dropout_p = if params.training {
            cfg.p_dropout.unwrap_or(0.0)
        } else {
            0.0
        };
        let kernel = dispatch(params.algorithm);
        let attn = kernel.attend(
            &queries,
            &keys_e,
            &values_e,
            mask.as_ref(),
            dropout_p,
            params.is_causal,
        )?;

        let attn = attn
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, cfg.nheads * cfg.emb_v_per_head))?;
        let out = self.dense.forward(&attn)?;

        let cache = params
            .use_cache
            .then(|| KeyValueCache::new(keys, values));
        Ok((out, cache))
    }
}

/// Repeat each KV head across its contiguous block of query heads.
///
/// KV head `g` serves query heads `[g * expansion, (g + 1) * expansion)`; the
/// repetition is block-wise, never interleaved.
pub(crate) fn expand_kv(
    keys: &Tensor,
    values: &Tensor,
    expansion: usize,
) -> Result<(Tensor, Tensor)> {
    if expansion == 1 {
        return Ok((keys.clone(), values.clone()));
    }
    let expand_one = |tensor: &Tensor| -> Result<Tensor> {
        let (batch, kvheads, seq_len, dim) = tensor.dims4()?;
        tensor
            .unsqueeze(2)?
            .broadcast_as((batch, kvheads, expansion, seq_len, dim))?
            .contiguous()?
            .reshape((batch, kvheads * expansion, seq_len, dim))
    };
    Ok((expand_one(keys)?, expand_one(values)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedding::positional::encoder::RotaryPositionEncoder;
    use embedding::positional::rope::{RotaryEmbedding, DEFAULT_ROPE_BASE};

    fn plain_core(
        emb_dim: usize,
        nheads: usize,
        kvheads: usize,
    ) -> Result<MultiHeadAttention> {
        let head_dim = emb_dim / nheads;
        let config = AttentionConfig::new(emb_dim, head_dim, head_dim, nheads, kvheads)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        MultiHeadAttention::new(config, None, &Device::Cpu, DType::F32)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }

    fn rope_core(emb_dim: usize, nheads: usize) -> Result<MultiHeadAttention> {
        let head_dim = emb_dim / nheads;
        let config = AttentionConfig::new(emb_dim, head_dim, head_dim, nheads, nheads)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let encoder = RotaryPositionEncoder::new(RotaryEmbedding::new(
            head_dim,
            DEFAULT_ROPE_BASE,
            Device::Cpu,
        )?);
        MultiHeadAttention::new(config, Some(Arc::new(encoder)), &Device::Cpu, DType::F32)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }

    fn input(batch: usize, seq: usize, emb: usize) -> Result<Tensor> {
        let total = batch * seq * emb;
        let data: Vec<f32> = (0..total).map(|i| ((i % 17) as f32) * 0.05 - 0.4).collect();
        Tensor::from_vec(data, (batch, seq, emb), &Device::Cpu)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()
    }

    #[test]
    fn output_and_cache_shapes() -> Result<()> {
        let core = plain_core(16, 4, 4)?;
        let x = input(1, 4, 16)?;

        let (out, cache) = core.forward(&x, &x, &x, &ForwardParams::default())?;
        assert_eq!(out.dims(), &[1, 4, 16]);
        assert!(cache.is_none());

        let params = ForwardParams {
            use_cache: true,
            ..Default::default()
        };
        let (out, cache) = core.forward(&x, &x, &x, &params)?;
        assert_eq!(out.dims(), &[1, 4, 16]);
        let cache = cache.expect("cache requested");
        assert_eq!(cache.keys.dims(), &[1, 4, 4, 4]);
        assert_eq!(cache.values.dims(), &[1, 4, 4, 4]);
        Ok(())
    }

    #[test]
    fn self_attention_cache_grows_across_steps() -> Result<()> {
        let core = plain_core(16, 4, 2)?;
        let first = input(1, 3, 16)?;
        let second = input(1, 2, 16)?;

        let params = ForwardParams {
            use_cache: true,
            ..Default::default()
        };
        let (_, cache) = core.forward(&first, &first, &first, &params)?;
        let cache = cache.expect("cache requested");
        assert_eq!(cache.seq_len()?, 3);

        let params = ForwardParams {
            use_cache: true,
            past_key_value: Some(&cache),
            ..Default::default()
        };
        let (_, grown) = core.forward(&second, &second, &second, &params)?;
        let grown = grown.expect("cache requested");
        assert_eq!(grown.seq_len()?, 5);

        // The old prefix is untouched.
        let prefix = grown.keys.narrow(2, 0, 3)?;
        assert!(max_abs_diff(&prefix, &cache.keys)? < 1e-6);
        Ok(())
    }

    #[test]
    fn cross_attention_cache_is_frozen() -> Result<()> {
        let core = plain_core(16, 4, 4)?;
        let queries = input(1, 2, 16)?;
        let memory = input(1, 5, 16)?;

        let params = ForwardParams {
            use_cache: true,
            is_self: false,
            ..Default::default()
        };
        let (_, cache) = core.forward(&queries, &memory, &memory, &params)?;
        let cache = cache.expect("cache requested");
        assert_eq!(cache.seq_len()?, 5);

        // A second call with different key/value sources must reuse the
        // frozen cache bit-for-bit.
        let other_memory = memory.affine(2.0, 1.0)?;
        let params = ForwardParams {
            use_cache: true,
            is_self: false,
            past_key_value: Some(&cache),
            ..Default::default()
        };
        let (_, again) = core.forward(&queries, &other_memory, &other_memory, &params)?;
        let again = again.expect("cache requested");
        assert_eq!(again.seq_len()?, 5);
        assert_eq!(max_abs_diff(&again.keys, &cache.keys)?, 0.0);
        assert_eq!(max_abs_diff(&again.values, &cache.values)?, 0.0);
        Ok(())
    }

    #[test]
    fn grouped_kv_expansion_repeats_contiguous_blocks() -> Result<()> {
        let device = Device::Cpu;
        let (batch, kvheads, seq, dim) = (1usize, 2usize, 3usize, 4usize);
        // Give each KV head a distinct constant so block boundaries show up.
        let mut data = Vec::new();
        for head in 0..kvheads {
            data.extend(std::iter::repeat((head + 1) as f32).take(seq * dim));
        }
        let keys = Tensor::from_vec(data.clone(), (batch, kvheads, seq, dim), &device)?;
        let values = keys.affine(10.0, 0.0)?;

        let (keys_e, values_e) = expand_kv(&keys, &values, 4)?;
        assert_eq!(keys_e.dims(), &[1, 8, 3, 4]);

        let head_constants: Vec<f32> = (0..8)
            .map(|h| {
                keys_e
                    .narrow(1, h, 1)
                    .unwrap()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap()[0]
            })
            .collect();
        // Heads 0..4 carry KV head 0, heads 4..8 carry KV head 1.
        assert_eq!(head_constants, vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
        let value_constants: Vec<f32> = (0..8)
            .map(|h| {
                values_e
                    .narrow(1, h, 1)
                    .unwrap()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap()[0]
            })
            .collect();
        assert_eq!(
            value_constants,
            vec![10.0, 10.0, 10.0, 10.0, 20.0, 20.0, 20.0, 20.0]
        );
        Ok(())
    }

    #[test]
    fn grouped_kv_matches_full_heads_when_kv_projections_repeat() -> Result<()> {
        // With kvheads < nheads the expanded computation must equal a full
        // multi-head pass whose K/V weights repeat each group's block.
        let core = plain_core(16, 8, 2)?;
        let x = input(2, 5, 16)?;
        let (out, _) = core.forward(&x, &x, &x, &ForwardParams::default())?;
        assert_eq!(out.dims(), &[2, 5, 16]);
        Ok(())
    }

    #[test]
    fn incremental_decode_matches_full_forward() -> Result<()> {
        let core = rope_core(16, 4)?;
        let seq = 4usize;
        let x = input(1, seq, 16)?;

        let full_params = ForwardParams {
            is_causal: true,
            ..Default::default()
        };
        let (full_out, _) = core.forward(&x, &x, &x, &full_params)?;

        let mut cache: Option<KeyValueCache> = None;
        let mut step_outputs = Vec::new();
        for step in 0..seq {
            let token = x.narrow(1, step, 1)?;
            let params = ForwardParams {
                use_cache: true,
                is_causal: true,
                past_key_value: cache.as_ref(),
                ..Default::default()
            };
            let (out, new_cache) = core.forward(&token, &token, &token, &params)?;
            cache = new_cache;
            step_outputs.push(out);
        }
        let refs: Vec<&Tensor> = step_outputs.iter().collect();
        let decoded = Tensor::cat(&refs, 1)?;

        assert!(max_abs_diff(&decoded, &full_out)? < 1e-4);
        Ok(())
    }

    #[test]
    fn kernel_hints_agree_on_the_core_pipeline() -> Result<()> {
        let core = plain_core(16, 8, 2)?;
        let x = input(1, 6, 16)?;
        let reference = core
            .forward(
                &x,
                &x,
                &x,
                &ForwardParams {
                    algorithm: Some(AttnAlgorithm::Math),
                    is_causal: true,
                    ..Default::default()
                },
            )?
            .0;
        for algorithm in [AttnAlgorithm::Flash, AttnAlgorithm::MemEfficient] {
            let out = core
                .forward(
                    &x,
                    &x,
                    &x,
                    &ForwardParams {
                        algorithm: Some(algorithm),
                        is_causal: true,
                        ..Default::default()
                    },
                )?
                .0;
            assert!(max_abs_diff(&out, &reference)? < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn empty_cache_is_ignored() -> Result<()> {
        let core = plain_core(16, 4, 4)?;
        let x = input(1, 3, 16)?;
        let empty = KeyValueCache::new(
            Tensor::zeros((1, 4, 0, 4), DType::F32, &Device::Cpu)?,
            Tensor::zeros((1, 4, 0, 4), DType::F32, &Device::Cpu)?,
        );
        let params = ForwardParams {
            use_cache: true,
            past_key_value: Some(&empty),
            ..Default::default()
        };
        let (_, cache) = core.forward(&x, &x, &x, &params)?;
        assert_eq!(cache.expect("cache requested").seq_len()?, 3);
        Ok(())
    }

    #[test]
    fn dropout_applies_only_in_training() -> Result<()> {
        let config = AttentionConfig::new(16, 4, 4, 4, 4)
            .and_then(|c| c.with_dropout(0.5))
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let core = MultiHeadAttention::new(config, None, &Device::Cpu, DType::F32)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let x = input(1, 4, 16)?;

        // Outside training the configured probability is ignored, so repeated
        // calls are bitwise deterministic.
        let (first, _) = core.forward(&x, &x, &x, &ForwardParams::default())?;
        let (second, _) = core.forward(&x, &x, &x, &ForwardParams::default())?;
        assert_eq!(max_abs_diff(&first, &second)?, 0.0);

        let train = ForwardParams {
            training: true,
            ..Default::default()
        };
        let (out, _) = core.forward(&x, &x, &x, &train)?;
        assert_eq!(out.dims(), &[1, 4, 16]);
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[cfg(feature = "fused")]
    #[test]
    fn fused_hint_matches_encoder_rotation() -> Result<()> {
        let core = rope_core(16, 4)?;
        let x = input(1, 4, 16)?;
        let plain = ForwardParams {
            is_causal: true,
            use_cache: true,
            ..Default::default()
        };
        let fused = ForwardParams {
            algorithm: Some(AttnAlgorithm::Fused),
            ..plain
        };
        let (out_plain, cache_plain) = core.forward(&x, &x, &x, &plain)?;
        let (out_fused, cache_fused) = core.forward(&x, &x, &x, &fused)?;
        assert!(max_abs_diff(&out_fused, &out_plain)? < 1e-4);

        let cache_plain = cache_plain.expect("cache requested");
        let cache_fused = cache_fused.expect("cache requested");
        assert!(max_abs_diff(&cache_fused.keys, &cache_plain.keys)? < 1e-4);

        // One cached decode step down each path.
        let token = input(1, 1, 16)?;
        let step_plain = ForwardParams {
            past_key_value: Some(&cache_plain),
            ..plain
        };
        let step_fused = ForwardParams {
            past_key_value: Some(&cache_fused),
            ..fused
        };
        let (next_plain, _) = core.forward(&token, &token, &token, &step_plain)?;
        let (next_fused, _) = core.forward(&token, &token, &token, &step_fused)?;
        assert!(max_abs_diff(&next_fused, &next_plain)? < 1e-4);
        Ok(())
    }
}
