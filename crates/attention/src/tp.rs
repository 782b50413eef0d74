//! Tensor-parallel attention over a head partition.
//!
//! [`TpMultiHeadAttention`] wraps one local [`MultiHeadAttention`] per worker:
//! query heads are split evenly across the world, key/value heads are split
//! when there are enough of them and replicated otherwise. Inputs arrive
//! replicated on every worker, each worker attends over its own head slice,
//! and the dense outputs are sum-reduced through a [`Collective`]. The
//! key/value cache is never communicated; every worker keeps the slice
//! matching its own heads.
//!
//! Checkpoints store unpartitioned parameters. [`TpMultiHeadAttention::
//! load_weights`] slices row blocks out of the query/key/value projections at
//! head granularity and column blocks out of the dense projection, so the
//! per-worker matmuls compose back into the unsharded result under the sum
//! reduction. The dense bias is replicated but scaled by `1 / world_size`,
//! which makes the reduction recover it exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};
use embedding::positional::encoder::PositionEncoder;

use crate::cache::KeyValueCache;
use crate::core::{AttentionConfig, AttentionError};
use crate::mha::{ForwardParams, MultiHeadAttention, ProjectionRole};

/// Communication backend connecting the workers of one partition.
///
/// Implementations wrap whatever transport the deployment uses; the wrapper
/// only ever asks for its coordinates and an element-wise sum across the
/// world.
pub trait Collective: std::fmt::Debug + Send + Sync {
    /// This worker's index in `[0, world_size)`.
    fn rank(&self) -> usize;

    /// Number of cooperating workers.
    fn world_size(&self) -> usize;

    /// Element-wise sum of `tensor` across all workers.
    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor>;
}

/// Trivial collective for a world of one; the reduction is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleWorker;

impl Collective for SingleWorker {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}

/// How one worker's head slice relates to the full layer.
///
/// Query heads always divide evenly across the world. Key/value heads divide
/// when `kvheads >= world_size`; otherwise each KV head is replicated on
/// `world_size / kvheads` consecutive workers and every worker holds exactly
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub rank: usize,
    pub world_size: usize,
    /// Query heads of the full, unpartitioned layer.
    pub nheads: usize,
    /// Key/value heads of the full, unpartitioned layer.
    pub kvheads: usize,
    pub local_nheads: usize,
    pub local_kvheads: usize,
}

impl PartitionDescriptor {
    pub fn new(
        nheads: usize,
        kvheads: usize,
        rank: usize,
        world_size: usize,
    ) -> std::result::Result<Self, AttentionError> {
        if world_size == 0 || rank >= world_size {
            return Err(AttentionError::Config {
                context: format!("rank {rank} out of range for world size {world_size}"),
            });
        }
        if nheads % world_size != 0 {
            return Err(AttentionError::Config {
                context: format!(
                    "nheads {nheads} must be a multiple of world size {world_size}"
                ),
            });
        }
        let local_kvheads = if kvheads >= world_size {
            if kvheads % world_size != 0 {
                return Err(AttentionError::Config {
                    context: format!(
                        "kvheads {kvheads} must be a multiple of world size {world_size}"
                    ),
                });
            }
            kvheads / world_size
        } else {
            if world_size % kvheads != 0 {
                return Err(AttentionError::Config {
                    context: format!(
                        "world size {world_size} must be a multiple of kvheads {kvheads} \
                         when replicating key/value heads"
                    ),
                });
            }
            1
        };
        Ok(Self {
            rank,
            world_size,
            nheads,
            kvheads,
            local_nheads: nheads / world_size,
            local_kvheads,
        })
    }

    /// True when KV heads are replicated rather than split.
    pub fn kv_replicated(&self) -> bool {
        self.kvheads < self.world_size
    }
}

/// Slice the head block owned by `rank` out of dimension 0.
///
/// `heads` is the full head count for this projection and `rows_per_head` the
/// number of rows each head contributes. In the replicated regime
/// (`heads < world`) consecutive ranks share a head and each receives that
/// single head's block.
fn shard_heads(
    tensor: &Tensor,
    heads: usize,
    rows_per_head: usize,
    rank: usize,
    world_size: usize,
) -> std::result::Result<Tensor, AttentionError> {
    if tensor.dim(0)? != heads * rows_per_head {
        return Err(AttentionError::Config {
            context: format!(
                "cannot shard dim 0 of size {} into {heads} heads of {rows_per_head} rows",
                tensor.dim(0)?
            ),
        });
    }
    let sliced = if heads >= world_size {
        let heads_per_rank = heads / world_size;
        tensor.narrow(
            0,
            rank * heads_per_rank * rows_per_head,
            heads_per_rank * rows_per_head,
        )?
    } else {
        let ranks_per_head = world_size / heads;
        let head = rank / ranks_per_head;
        tensor.narrow(0, head * rows_per_head, rows_per_head)?
    };
    Ok(sliced.contiguous()?)
}

/// Slice the column block owned by `rank` out of dimension 1.
fn shard_columns(
    tensor: &Tensor,
    rank: usize,
    world_size: usize,
) -> std::result::Result<Tensor, AttentionError> {
    let cols = tensor.dim(1)?;
    if cols % world_size != 0 {
        return Err(AttentionError::Config {
            context: format!(
                "cannot split {cols} columns evenly across world size {world_size}"
            ),
        });
    }
    let per_rank = cols / world_size;
    Ok(tensor.narrow(1, rank * per_rank, per_rank)?.contiguous()?)
}

fn key_matches(key: &str, name: &str) -> bool {
    key == name || key.ends_with(&format!(".{name}"))
}

/// One worker's share of a tensor-parallel attention layer.
pub struct TpMultiHeadAttention {
    config: AttentionConfig,
    partition: PartitionDescriptor,
    local: MultiHeadAttention,
    collective: Arc<dyn Collective>,
}

impl std::fmt::Debug for TpMultiHeadAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpMultiHeadAttention")
            .field("partition", &self.partition)
            .field("local", &self.local)
            .finish()
    }
}

impl TpMultiHeadAttention {
    /// Build this worker's shard of a layer described by the full `config`.
    pub fn new(
        config: AttentionConfig,
        position_encoder: Option<Arc<dyn PositionEncoder>>,
        collective: Arc<dyn Collective>,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, AttentionError> {
        let partition = PartitionDescriptor::new(
            config.nheads,
            config.kvheads,
            collective.rank(),
            collective.world_size(),
        )?;
        let local_config = AttentionConfig {
            nheads: partition.local_nheads,
            kvheads: partition.local_kvheads,
            ..config.clone()
        };
        let local = MultiHeadAttention::new(local_config, position_encoder, device, dtype)?;
        log::info!(
            "tensor-parallel attention: rank {}/{} holds {}/{} query heads, {}/{} kv heads{}",
            partition.rank,
            partition.world_size,
            partition.local_nheads,
            partition.nheads,
            partition.local_kvheads,
            partition.kvheads,
            if partition.kv_replicated() {
                " (replicated)"
            } else {
                ""
            },
        );
        Ok(Self {
            config,
            partition,
            local,
            collective,
        })
    }

    /// Geometry of the full, unpartitioned layer.
    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn partition(&self) -> &PartitionDescriptor {
        &self.partition
    }

    /// The local shard; its cache and projections cover this worker's heads
    /// only.
    pub fn local(&self) -> &MultiHeadAttention {
        &self.local
    }

    fn shard_projection(
        &self,
        role: ProjectionRole,
        weight: &Tensor,
        bias: Option<&Tensor>,
    ) -> std::result::Result<(Tensor, Option<Tensor>), AttentionError> {
        let cfg = &self.config;
        let (rank, world) = (self.partition.rank, self.partition.world_size);
        let sharded = match role {
            ProjectionRole::Query => {
                let weight =
                    shard_heads(weight, cfg.nheads, cfg.emb_kq_per_head, rank, world)?;
                let bias = bias
                    .map(|b| shard_heads(b, cfg.nheads, cfg.emb_kq_per_head, rank, world))
                    .transpose()?;
                (weight, bias)
            }
            ProjectionRole::Key => {
                let weight =
                    shard_heads(weight, cfg.kvheads, cfg.emb_kq_per_head, rank, world)?;
                let bias = bias
                    .map(|b| shard_heads(b, cfg.kvheads, cfg.emb_kq_per_head, rank, world))
                    .transpose()?;
                (weight, bias)
            }
            ProjectionRole::Value => {
                let weight =
                    shard_heads(weight, cfg.kvheads, cfg.emb_v_per_head, rank, world)?;
                let bias = bias
                    .map(|b| shard_heads(b, cfg.kvheads, cfg.emb_v_per_head, rank, world))
                    .transpose()?;
                (weight, bias)
            }
            ProjectionRole::Dense => {
                let weight = shard_columns(weight, rank, world)?;
                // Replicated and summed by the reduction, so pre-divide.
                let bias = bias
                    .map(|b| -> std::result::Result<Tensor, AttentionError> {
                        Ok(b.affine(1.0 / world as f64, 0.0)?)
                    })
                    .transpose()?;
                (weight, bias)
            }
        };
        Ok(sharded)
    }

    /// Install this worker's slice of an unpartitioned checkpoint.
    ///
    /// Entries match parameters by exact name or by dotted suffix, so both
    /// `"query.weight"` and `"model.layer0.attn.query.weight"` bind to the
    /// query projection. Every entry must bind to some parameter and every
    /// parameter must be bound; extra entries raise
    /// [`AttentionError::UnusedWeights`] before anything is modified.
    /// Loading is atomic: any error, at any role, leaves the current
    /// parameters in place.
    pub fn load_weights(
        &mut self,
        weights: &HashMap<String, Tensor>,
    ) -> std::result::Result<(), AttentionError> {
        let roles = [
            ProjectionRole::Query,
            ProjectionRole::Key,
            ProjectionRole::Value,
            ProjectionRole::Dense,
        ];
        let mut expected = Vec::new();
        for role in roles {
            expected.push(format!("{}.weight", role.name()));
            if self.config.use_bias {
                expected.push(format!("{}.bias", role.name()));
            }
        }

        let mut unused: Vec<String> = weights
            .keys()
            .filter(|key| !expected.iter().any(|name| key_matches(key, name)))
            .cloned()
            .collect();
        if !unused.is_empty() {
            unused.sort();
            return Err(AttentionError::UnusedWeights { keys: unused });
        }

        let lookup = |name: &str| -> std::result::Result<&Tensor, AttentionError> {
            weights
                .iter()
                .find(|(key, _)| key_matches(key, name))
                .map(|(_, tensor)| tensor)
                .ok_or_else(|| AttentionError::MissingWeight(name.to_string()))
        };

        // Resolve and shard every role before touching the layer; a failure
        // anywhere must leave the current parameters in place.
        let mut staged = Vec::with_capacity(roles.len());
        for role in roles {
            let weight = lookup(&format!("{}.weight", role.name()))?;
            let bias = if self.config.use_bias {
                Some(lookup(&format!("{}.bias", role.name()))?)
            } else {
                None
            };
            let (weight, bias) = self.shard_projection(role, weight, bias)?;
            staged.push((role, weight, bias));
        }
        self.local.set_projections(staged)?;
        log::info!(
            "loaded attention weights: rank {}/{}",
            self.partition.rank,
            self.partition.world_size
        );
        Ok(())
    }

    /// Run the local shard and sum-reduce the output across the world.
    ///
    /// Inputs must be identical on every worker. The returned cache holds
    /// this worker's key/value heads only and must be fed back to the same
    /// worker on the next step.
    pub fn forward(
        &self,
        q_src: &Tensor,
        k_src: &Tensor,
        v_src: &Tensor,
        params: &ForwardParams,
    ) -> Result<(Tensor, Option<KeyValueCache>)> {
        let (local_out, cache) = self.local.forward(q_src, k_src, v_src, params)?;
        let out = self.collective.all_reduce_sum(&local_out)?;
        Ok((out, cache))
    }
}
