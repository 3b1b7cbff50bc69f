//! Logical → physical address translation.
//!
//! A logical block or slot id is decomposed mixed-radix style across the
//! configured sharding axes, in declared order. Each sharded axis
//! contributes one shard coordinate; what is left over after the last axis
//! is the id local to its shard.
//!
//! ```text
//! logical id ──► [coord(axis_0), coord(axis_1), …, local id]
//! ```
//!
//! Head-sharded axes are not resolved here: their coordinate is the
//! [`UNSHARDED`] sentinel and the attention side picks the shard from the
//! head index it is working on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::attention::{CacheConfig, ConfigError, DimKind};

/// Shard coordinate meaning "not subdivided at request-translation time".
pub const UNSHARDED: i64 = -1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardingError {
    #[error("Can't shard evenly: {num_blocks} blocks across parallelism {parallelism}")]
    UnevenShard { num_blocks: usize, parallelism: usize },

    #[error("Unsupported sharding axis: {0}")]
    UnsupportedAxis(DimKind),

    #[error("Head-sharded axis must use exactly one hierarchy dimension for slots, got {0}")]
    MultiIndexHeadPolicy(usize),

    #[error("Policy index {index} out of range for hierarchy of rank {rank}")]
    PolicyOutOfRange { index: usize, rank: usize },

    #[error("Parallelism of policy {0:?} overflows")]
    ParallelismOverflow(Vec<usize>),

    #[error("Address row has width {got}, expected {expected}")]
    AddressWidth { expected: usize, got: usize },

    #[error("Id {0} is not representable in a physical address")]
    IdOverflow(usize),
}

/// Sizes of each dimension of the device mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct Hierarchy(Vec<usize>);

impl Hierarchy {
    /// A mesh with the given dimension sizes; every size must be positive.
    pub fn new(dims: Vec<usize>) -> Result<Self, ConfigError> {
        if let Some(index) = dims.iter().position(|&d| d == 0) {
            return Err(ConfigError::InvalidHierarchy { index });
        }
        Ok(Self(dims))
    }

    /// Size of each mesh dimension.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of mesh dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Product of the hierarchy sizes a policy references.
    pub fn parallelism(&self, policy: &[usize]) -> Result<usize, ShardingError> {
        policy.iter().try_fold(1usize, |acc, &index| {
            let size = self.0.get(index).ok_or(ShardingError::PolicyOutOfRange {
                index,
                rank: self.rank(),
            })?;
            acc.checked_mul(*size)
                .ok_or_else(|| ShardingError::ParallelismOverflow(policy.to_vec()))
        })
    }
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self(vec![1])
    }
}

impl TryFrom<Vec<usize>> for Hierarchy {
    type Error = ConfigError;

    fn try_from(dims: Vec<usize>) -> Result<Self, Self::Error> {
        Self::new(dims)
    }
}

impl From<Hierarchy> for Vec<usize> {
    fn from(h: Hierarchy) -> Self {
        h.0
    }
}

/// Borrowed view over one physical address row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAddress<'a> {
    row: &'a [i64],
}

impl<'a> PhysicalAddress<'a> {
    /// `None` for an empty row: every address carries at least a local id.
    pub fn new(row: &'a [i64]) -> Option<Self> {
        if row.is_empty() {
            None
        } else {
            Some(Self { row })
        }
    }

    pub fn width(&self) -> usize {
        self.row.len()
    }

    /// One coordinate per sharded axis.
    pub fn shard_coords(&self) -> &'a [i64] {
        &self.row[..self.row.len() - 1]
    }

    /// Block or slot id local to the owning shard.
    pub fn local_id(&self) -> i64 {
        self.row[self.row.len() - 1]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Granularity {
    Block,
    Slot,
}

/// Pure logical → physical translation for one (config, hierarchy, pool size).
#[derive(Debug, Clone, Copy)]
pub struct AddressTranslator<'a> {
    config: &'a CacheConfig,
    hierarchy: &'a Hierarchy,
    num_blocks: usize,
}

impl<'a> AddressTranslator<'a> {
    pub fn new(config: &'a CacheConfig, hierarchy: &'a Hierarchy, num_blocks: usize) -> Self {
        Self {
            config,
            hierarchy,
            num_blocks,
        }
    }

    pub fn addr_width(&self) -> usize {
        self.config.addr_width()
    }

    /// Translate a logical block id into `out` (one block-table row).
    pub fn materialize_block_id(
        &self,
        logical_block_id: usize,
        out: &mut [i64],
    ) -> Result<(), ShardingError> {
        self.materialize(logical_block_id, Granularity::Block, out)
    }

    /// Translate a logical slot id into `out` (one slot-mapping row).
    pub fn materialize_slot_id(
        &self,
        logical_slot_id: usize,
        out: &mut [i64],
    ) -> Result<(), ShardingError> {
        self.materialize(logical_slot_id, Granularity::Slot, out)
    }

    fn materialize(
        &self,
        logical_id: usize,
        granularity: Granularity,
        out: &mut [i64],
    ) -> Result<(), ShardingError> {
        let width = self.addr_width();
        if out.len() != width {
            return Err(ShardingError::AddressWidth {
                expected: width,
                got: out.len(),
            });
        }

        let unit = match granularity {
            Granularity::Block => 1,
            Granularity::Slot => self.config.block_size,
        };

        let mut id = logical_id;
        for (coord, shard) in out.iter_mut().zip(&self.config.sharding) {
            match shard.axis {
                DimKind::NumBlocks => {
                    let parallelism = self.hierarchy.parallelism(&shard.policy)?;
                    // Every shard holds the same number of blocks; any remainder is refused.
                    if self.num_blocks == 0 || self.num_blocks % parallelism != 0 {
                        return Err(ShardingError::UnevenShard {
                            num_blocks: self.num_blocks,
                            parallelism,
                        });
                    }
                    let tile = (self.num_blocks / parallelism)
                        .checked_mul(unit)
                        .ok_or(ShardingError::IdOverflow(logical_id))?;
                    *coord = to_i64(id / tile)?;
                    id %= tile;
                }
                DimKind::NumKvHeads => {
                    self.hierarchy.parallelism(&shard.policy)?;
                    if granularity == Granularity::Slot && shard.policy.len() != 1 {
                        return Err(ShardingError::MultiIndexHeadPolicy(shard.policy.len()));
                    }
                    *coord = UNSHARDED;
                }
                other => return Err(ShardingError::UnsupportedAxis(other)),
            }
        }
        out[width - 1] = to_i64(id)?;
        Ok(())
    }
}

fn to_i64(value: usize) -> Result<i64, ShardingError> {
    i64::try_from(value).map_err(|_| ShardingError::IdOverflow(value))
}
