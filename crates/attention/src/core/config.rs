//! Static configuration for multi-head attention layers.

use crate::core::errors::AttentionError;

/// Immutable geometry and behaviour knobs, fixed at construction.
///
/// `kvheads` may be smaller than `nheads` (grouped-query attention), in which
/// case each key/value head serves a contiguous block of
/// `nheads / kvheads` query heads.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionConfig {
    /// Latent dimensionality of input and output tensors.
    pub emb_dim: usize,
    /// Per-head dimensionality of query and key projections.
    pub emb_kq_per_head: usize,
    /// Per-head dimensionality of the value projection.
    pub emb_v_per_head: usize,
    /// Number of query heads.
    pub nheads: usize,
    /// Number of key/value heads; must divide `nheads`.
    pub kvheads: usize,
    /// Dropout probability applied to attention weights during training.
    pub p_dropout: Option<f32>,
    /// Whether projection layers carry bias vectors.
    pub use_bias: bool,
}

impl AttentionConfig {
    /// Build and validate a configuration.
    pub fn new(
        emb_dim: usize,
        emb_kq_per_head: usize,
        emb_v_per_head: usize,
        nheads: usize,
        kvheads: usize,
    ) -> Result<Self, AttentionError> {
        let cfg = Self {
            emb_dim,
            emb_kq_per_head,
            emb_v_per_head,
            nheads,
            kvheads,
            p_dropout: None,
            use_bias: false,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Enable dropout with the given probability.
    pub fn with_dropout(mut self, p: f32) -> Result<Self, AttentionError> {
        self.p_dropout = Some(p);
        self.validate()?;
        Ok(self)
    }

    /// Toggle bias vectors on the four projections.
    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// How many query heads each key/value head serves.
    pub fn expansion(&self) -> usize {
        self.nheads / self.kvheads
    }

    fn validate(&self) -> Result<(), AttentionError> {
        if self.emb_dim == 0 || self.emb_kq_per_head == 0 || self.emb_v_per_head == 0 {
            return Err(AttentionError::Config {
                context: format!(
                    "embedding dimensions must be non-zero, got emb_dim={} emb_kq={} emb_v={}",
                    self.emb_dim, self.emb_kq_per_head, self.emb_v_per_head
                ),
            });
        }
        if self.nheads == 0 || self.kvheads == 0 {
            return Err(AttentionError::Config {
                context: format!(
                    "head counts must be non-zero, got nheads={} kvheads={}",
                    self.nheads, self.kvheads
                ),
            });
        }
        if self.nheads % self.kvheads != 0 {
            return Err(AttentionError::Config {
                context: format!(
                    "nheads {} must be a multiple of kvheads {}",
                    self.nheads, self.kvheads
                ),
            });
        }
        if let Some(p) = self.p_dropout {
            if !(0.0..1.0).contains(&p) {
                return Err(AttentionError::Config {
                    context: format!("dropout probability must be in [0, 1), got {p}"),
                });
            }
        }
        Ok(())
    }
}
