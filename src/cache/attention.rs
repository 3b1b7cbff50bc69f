//! Attention cache configuration.
//!
//! [`CacheConfig`] describes one paged cache tensor: its logical dimensions,
//! the physical ordering of those dimensions, vectorization hints, and how
//! the tensor is partitioned across the device mesh. It is pure data; the
//! only derived view is [`CacheConfig::block_layout`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::tensor::DType;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cache layout {0:?} is not a permutation of the six cache dimensions")]
    InvalidLayout(Vec<DimKind>),

    #[error("Packed axes ({axes}) and lanes ({lanes}) differ in length")]
    PackingMismatch { axes: usize, lanes: usize },

    #[error("Cache dimension {0} must be positive")]
    ZeroDimension(&'static str),

    #[error("Hierarchy dimension {index} has size zero")]
    InvalidHierarchy { index: usize },

    #[error("max_model_len {max_model_len} is not a multiple of block_size {block_size}")]
    UnalignedModelLen {
        max_model_len: usize,
        block_size: usize,
    },

    #[error("Physical capacity of {num_blocks} blocks x {block_size} slots is not addressable")]
    CapacityOverflow { num_blocks: usize, block_size: usize },

    #[error("Attention config is not paged; a scheduler needs a paged cache")]
    NotPaged,

    #[error("Size of {0} overflows usize")]
    SizeOverflow(&'static str),
}

/// One logical axis a cache tensor may be ordered or sharded over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimKind {
    NumBlocks,
    NumLayers,
    Kv,
    BlockSize,
    NumKvHeads,
    HeadDim,
}

impl DimKind {
    pub const ALL: [DimKind; 6] = [
        DimKind::NumBlocks,
        DimKind::NumLayers,
        DimKind::Kv,
        DimKind::BlockSize,
        DimKind::NumKvHeads,
        DimKind::HeadDim,
    ];
}

impl std::fmt::Display for DimKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DimKind::NumBlocks => "num_blocks",
            DimKind::NumLayers => "num_layers",
            DimKind::Kv => "kv",
            DimKind::BlockSize => "block_size",
            DimKind::NumKvHeads => "num_kv_heads",
            DimKind::HeadDim => "head_dim",
        };
        f.write_str(name)
    }
}

/// A sharded cache axis and the hierarchy dimensions it is split across.
///
/// The sizes of the referenced hierarchy dimensions multiply to the axis's
/// parallelism factor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingAxis {
    pub axis: DimKind,
    pub policy: Vec<usize>,
}

impl ShardingAxis {
    pub fn new(axis: DimKind, policy: Vec<usize>) -> Self {
        Self { axis, policy }
    }
}

fn default_cache_layout() -> Vec<DimKind> {
    DimKind::ALL.to_vec()
}

/// Static description of a paged KV cache tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of transformer layers.
    pub num_layers: usize,

    /// Number of KV heads (GQA/MQA aware).
    pub num_kv_heads: usize,

    /// Head dimension.
    pub head_dim: usize,

    /// Storage element type.
    pub dtype: DType,

    /// Tokens per block.
    pub block_size: usize,

    /// Physical ordering of the six cache dimensions, outermost first.
    #[serde(default = "default_cache_layout")]
    pub cache_layout: Vec<DimKind>,

    /// Axes packed into vector lanes. Carried for the kernel, not interpreted here.
    #[serde(default)]
    pub packed_axes: Vec<DimKind>,

    /// Lane count for each packed axis.
    #[serde(default)]
    pub lanes: Vec<usize>,

    /// Sharded axes in decomposition order.
    #[serde(default)]
    pub sharding: Vec<ShardingAxis>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(32, 8, 128, DType::F16, 16)
    }
}

impl CacheConfig {
    /// A config with the default layout, no packing and no sharding.
    pub fn new(
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
        dtype: DType,
        block_size: usize,
    ) -> Self {
        Self {
            num_layers,
            num_kv_heads,
            head_dim,
            dtype,
            block_size,
            cache_layout: default_cache_layout(),
            packed_axes: Vec::new(),
            lanes: Vec::new(),
            sharding: Vec::new(),
        }
    }

    pub fn with_cache_layout(mut self, layout: Vec<DimKind>) -> Self {
        self.cache_layout = layout;
        self
    }

    pub fn with_packing(mut self, packed_axes: Vec<DimKind>, lanes: Vec<usize>) -> Self {
        self.set_packing(packed_axes, lanes);
        self
    }

    pub fn with_sharding(mut self, sharding: Vec<ShardingAxis>) -> Self {
        self.sharding = sharding;
        self
    }

    pub fn set_cache_layout(&mut self, layout: Vec<DimKind>) {
        self.cache_layout = layout;
    }

    pub fn set_packing(&mut self, packed_axes: Vec<DimKind>, lanes: Vec<usize>) {
        self.packed_axes = packed_axes;
        self.lanes = lanes;
    }

    pub fn set_sharding(&mut self, sharding: Vec<ShardingAxis>) {
        self.sharding = sharding;
    }

    /// Sharded axes in declared order.
    pub fn sharding_axes(&self) -> impl Iterator<Item = DimKind> + '_ {
        self.sharding.iter().map(|s| s.axis)
    }

    /// Hierarchy indices of the `i`-th sharded axis.
    pub fn axis_policy(&self, i: usize) -> Option<&[usize]> {
        self.sharding.get(i).map(|s| s.policy.as_slice())
    }

    /// Components in a physical address: one per sharded axis plus the local id.
    pub fn addr_width(&self) -> usize {
        self.sharding.len() + 1
    }

    /// The `(head_dim, block_size)` sub-layout describing one block, in the
    /// relative order those two axes have in `cache_layout`.
    pub fn block_layout(&self) -> Vec<DimKind> {
        self.cache_layout
            .iter()
            .copied()
            .filter(|d| matches!(d, DimKind::HeadDim | DimKind::BlockSize))
            .collect()
    }

    /// Logical extent of an axis; `num_blocks` is a scheduler parameter.
    pub fn dim_size(&self, kind: DimKind, num_blocks: usize) -> usize {
        match kind {
            DimKind::NumBlocks => num_blocks,
            DimKind::NumLayers => self.num_layers,
            DimKind::Kv => 2,
            DimKind::BlockSize => self.block_size,
            DimKind::NumKvHeads => self.num_kv_heads,
            DimKind::HeadDim => self.head_dim,
        }
    }

    /// Bytes of one block across all layers, heads, K and V; `None` on overflow.
    pub fn block_bytes(&self) -> Option<usize> {
        [
            self.num_kv_heads,
            self.head_dim,
            2,
            self.num_layers,
            self.dtype.size_in_bytes(),
        ]
        .iter()
        .try_fold(self.block_size, |acc, n| acc.checked_mul(*n))
    }

    /// Check internal consistency. Hierarchy consistency is checked where a
    /// hierarchy is known (address translation and scheduler construction).
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("num_layers", self.num_layers),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
            ("block_size", self.block_size),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDimension(name));
            }
        }

        let is_permutation = self.cache_layout.len() == DimKind::ALL.len()
            && DimKind::ALL.iter().all(|d| self.cache_layout.contains(d));
        if !is_permutation {
            return Err(ConfigError::InvalidLayout(self.cache_layout.clone()));
        }

        if self.packed_axes.len() != self.lanes.len() {
            return Err(ConfigError::PackingMismatch {
                axes: self.packed_axes.len(),
                lanes: self.lanes.len(),
            });
        }

        Ok(())
    }
}

/// Non-paged attention: a contiguous per-sequence cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleAttentionConfig {
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub dtype: DType,
}

/// The closed set of attention cache configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttentionConfig {
    Simple(SimpleAttentionConfig),
    Paged(CacheConfig),
}

impl Default for AttentionConfig {
    fn default() -> Self {
        AttentionConfig::Paged(CacheConfig::default())
    }
}

impl AttentionConfig {
    pub fn num_layers(&self) -> usize {
        match self {
            AttentionConfig::Simple(c) => c.num_layers,
            AttentionConfig::Paged(c) => c.num_layers,
        }
    }

    pub fn num_kv_heads(&self) -> usize {
        match self {
            AttentionConfig::Simple(c) => c.num_kv_heads,
            AttentionConfig::Paged(c) => c.num_kv_heads,
        }
    }

    pub fn head_dim(&self) -> usize {
        match self {
            AttentionConfig::Simple(c) => c.head_dim,
            AttentionConfig::Paged(c) => c.head_dim,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            AttentionConfig::Simple(c) => c.dtype,
            AttentionConfig::Paged(c) => c.dtype,
        }
    }

    pub fn as_paged(&self) -> Result<&CacheConfig, ConfigError> {
        match self {
            AttentionConfig::Paged(c) => Ok(c),
            AttentionConfig::Simple(_) => Err(ConfigError::NotPaged),
        }
    }

    pub fn into_paged(self) -> Result<CacheConfig, ConfigError> {
        match self {
            AttentionConfig::Paged(c) => Ok(c),
            AttentionConfig::Simple(_) => Err(ConfigError::NotPaged),
        }
    }
}
