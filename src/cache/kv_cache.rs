//! The per-step KV cache snapshot handed to the attention kernel.
//!
//! [`BatchMetadata`] is the scheduler-owned, single-buffered batch
//! descriptor. [`PagedKvCache`] borrows it together with the per-shard
//! storage handles, so a snapshot cannot outlive the next `schedule()` call.
//!
//! The accessors consume physical addresses exactly as the scheduler
//! produced them; no translation happens here. Storage resolution:
//!
//! ```text
//! [c_0, …, c_k-1, local] ──► storage = row-major(c_0 … c_k-1) over topology
//!                            c_i == -1 on a head axis ──► shard from head_id
//! ```

use thiserror::Error;

use crate::cache::address::{Hierarchy, PhysicalAddress, ShardingError, UNSHARDED};
use crate::cache::attention::{CacheConfig, ConfigError, DimKind};
use crate::cache::scheduler::SchedulerError;
use crate::cache::tensor::{
    checked_num_elements, row_major_strides, IndexTensor, KvStorage, MemoryPool,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Address has width {got}, expected {expected}")]
    AddressWidth { expected: usize, got: usize },

    #[error("Shard coordinate {coord} on axis {axis} is outside parallelism {parallelism}")]
    ShardOutOfRange {
        axis: DimKind,
        coord: i64,
        parallelism: usize,
    },

    #[error("{axis} index {index} is outside the local extent {extent}")]
    LocalOutOfRange {
        axis: DimKind,
        index: i64,
        extent: usize,
    },

    #[error("Layer {layer} out of range ({num_layers} layers)")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    #[error("Head {head} out of range ({num_heads} KV heads)")]
    HeadOutOfRange { head: usize, num_heads: usize },

    #[error("Expected {expected} values, got {got}")]
    ValueLength { expected: usize, got: usize },

    #[error("Slot id tensor must be [n, {addr_width}], got {shape:?}")]
    SlotTensorShape { shape: Vec<usize>, addr_width: usize },

    #[error("Storage handle {index} does not exist ({count} handles)")]
    MissingStorage { index: usize, count: usize },

    #[error("Element offset {offset} is outside storage of {len} elements")]
    OffsetOutOfRange { offset: usize, len: usize },
}

/// Which half of the cache an access targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Key,
    Value,
}

impl CacheKind {
    /// Index along the `kv` axis.
    pub fn index(&self) -> usize {
        match self {
            CacheKind::Key => 0,
            CacheKind::Value => 1,
        }
    }
}

/// Shard topology and per-shard storage shape derived from a config.
#[derive(Debug, Clone)]
pub struct ShardLayout {
    cache_layout: Vec<DimKind>,
    topology: Vec<usize>,
    local_shape: Vec<usize>,
    local_strides: Vec<usize>,
    local_elements: usize,
    token_major: bool,
}

impl ShardLayout {
    /// Derive the topology (one extent per sharded axis, in declared order)
    /// and the local shape (cache layout with sharded axes divided, rounded up).
    ///
    /// Fails if one storage handle's element or byte count overflows `usize`.
    pub fn new(
        config: &CacheConfig,
        hierarchy: &Hierarchy,
        num_blocks: usize,
    ) -> Result<Self, SchedulerError> {
        let topology = config
            .sharding
            .iter()
            .map(|s| hierarchy.parallelism(&s.policy))
            .collect::<Result<Vec<_>, _>>()?;

        let mut local_shape = Vec::with_capacity(config.cache_layout.len());
        for &kind in &config.cache_layout {
            let divisor = config
                .sharding
                .iter()
                .zip(&topology)
                .filter(|(s, _)| s.axis == kind)
                .try_fold(1usize, |acc, (s, p)| {
                    acc.checked_mul(*p)
                        .ok_or_else(|| ShardingError::ParallelismOverflow(s.policy.clone()))
                })?;
            local_shape.push(config.dim_size(kind, num_blocks).div_ceil(divisor));
        }

        let local_elements = checked_num_elements(&local_shape)
            .filter(|n| n.checked_mul(config.dtype.size_in_bytes()).is_some())
            .ok_or(ConfigError::SizeOverflow("kv storage"))?;

        let token_major = config.block_layout().first() == Some(&DimKind::BlockSize);

        Ok(Self {
            cache_layout: config.cache_layout.clone(),
            local_strides: row_major_strides(&local_shape),
            topology,
            local_shape,
            local_elements,
            token_major,
        })
    }

    /// Extent of each sharded axis, in declared order.
    pub fn topology(&self) -> &[usize] {
        &self.topology
    }

    /// Number of storage handles (product of the topology).
    pub fn num_shards(&self) -> Result<usize, ShardingError> {
        self.topology.iter().try_fold(1usize, |acc, p| {
            acc.checked_mul(*p)
                .ok_or_else(|| ShardingError::ParallelismOverflow(self.topology.clone()))
        })
    }

    /// Shape of one storage handle, in cache-layout order.
    pub fn local_shape(&self) -> &[usize] {
        &self.local_shape
    }

    /// Elements in one storage handle.
    pub fn local_elements(&self) -> usize {
        self.local_elements
    }

    pub fn local_extent(&self, kind: DimKind) -> usize {
        self.cache_layout
            .iter()
            .position(|d| *d == kind)
            .map(|pos| self.local_shape[pos])
            .unwrap_or(0)
    }

    fn offset(&self, coords: &LocalCoords) -> Result<usize, AccessError> {
        let mut offset = 0;
        for ((kind, extent), stride) in self
            .cache_layout
            .iter()
            .zip(&self.local_shape)
            .zip(&self.local_strides)
        {
            let index = coords.get(*kind);
            if index >= *extent {
                return Err(AccessError::LocalOutOfRange {
                    axis: *kind,
                    index: index as i64,
                    extent: *extent,
                });
            }
            offset += index * stride;
        }
        Ok(offset)
    }
}

struct LocalCoords {
    block: usize,
    layer: usize,
    kv: usize,
    token: usize,
    head: usize,
    dim: usize,
}

impl LocalCoords {
    fn get(&self, kind: DimKind) -> usize {
        match kind {
            DimKind::NumBlocks => self.block,
            DimKind::NumLayers => self.layer,
            DimKind::Kv => self.kv,
            DimKind::BlockSize => self.token,
            DimKind::NumKvHeads => self.head,
            DimKind::HeadDim => self.dim,
        }
    }
}

/// A resolved access target inside one storage handle.
#[derive(Debug, Clone, Copy)]
struct Target {
    storage: usize,
    block: usize,
    token: usize,
    head: usize,
}

/// Scheduler-owned batch descriptor, overwritten in place on every call.
#[derive(Debug, Clone)]
pub struct BatchMetadata {
    pub(crate) num_seqs: usize,
    pub(crate) num_tokens: usize,
    pub(crate) context_lens: IndexTensor,
    pub(crate) seq_lens: IndexTensor,
    pub(crate) block_table: IndexTensor,
    pub(crate) slot_mapping: IndexTensor,
    pub(crate) conversation_id: u64,
}

impl BatchMetadata {
    /// The zero-valued shell a scheduler starts with.
    pub(crate) fn empty(addr_width: usize, pool: MemoryPool) -> Self {
        Self {
            num_seqs: 0,
            num_tokens: 0,
            context_lens: IndexTensor::zeros(&[0], pool),
            seq_lens: IndexTensor::zeros(&[0], pool),
            block_table: IndexTensor::zeros(&[0, 0, addr_width], pool),
            slot_mapping: IndexTensor::zeros(&[0, addr_width], pool),
            conversation_id: 0,
        }
    }

    pub fn num_seqs(&self) -> usize {
        self.num_seqs
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// Per-sequence context length before this step.
    pub fn context_lens(&self) -> &IndexTensor {
        &self.context_lens
    }

    /// Per-sequence length after this step.
    pub fn seq_lens(&self) -> &IndexTensor {
        &self.seq_lens
    }

    /// `[num_seqs, max_blocks_in_batch, addr_width]`, right-padded with zeros.
    pub fn block_table(&self) -> &IndexTensor {
        &self.block_table
    }

    /// `[num_tokens, addr_width]`, session order then token order.
    pub fn slot_mapping(&self) -> &IndexTensor {
        &self.slot_mapping
    }

    pub fn conversation_id(&self) -> u64 {
        self.conversation_id
    }
}

/// Snapshot of the paged cache for one scheduled step.
#[derive(Debug)]
pub struct PagedKvCache<'a> {
    pub(crate) config: &'a CacheConfig,
    pub(crate) layout: &'a ShardLayout,
    pub(crate) batch: &'a BatchMetadata,
    pub(crate) storages: &'a mut [KvStorage],
    pub(crate) num_blocks: usize,
}

impl<'a> PagedKvCache<'a> {
    pub fn batch(&self) -> &BatchMetadata {
        self.batch
    }

    pub fn num_seqs(&self) -> usize {
        self.batch.num_seqs
    }

    pub fn num_tokens(&self) -> usize {
        self.batch.num_tokens
    }

    pub fn context_lens(&self) -> &IndexTensor {
        &self.batch.context_lens
    }

    pub fn seq_lens(&self) -> &IndexTensor {
        &self.batch.seq_lens
    }

    pub fn block_table(&self) -> &IndexTensor {
        &self.batch.block_table
    }

    pub fn slot_mapping(&self) -> &IndexTensor {
        &self.batch.slot_mapping
    }

    pub fn conversation_id(&self) -> u64 {
        self.batch.conversation_id
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Storage handles, one per shard-topology coordinate in row-major order.
    pub fn kv_caches(&self) -> &[KvStorage] {
        self.storages
    }

    pub fn kv_cache(&self, index: usize) -> Option<&KvStorage> {
        self.storages.get(index)
    }

    /// Read one block for a layer and head: `block_size * head_dim` values
    /// ordered as [`CacheConfig::block_layout`].
    pub fn get_block(
        &self,
        kind: CacheKind,
        layer_id: usize,
        head_id: usize,
        block_id: &[i64],
    ) -> Result<Vec<f32>, AccessError> {
        let target = self.resolve(layer_id, head_id, block_id, false)?;
        let storage = self.storage(target.storage)?;
        self.block_coords()
            .map(|(token, dim)| -> Result<f32, AccessError> {
                let offset = self.element_offset(kind, layer_id, &target, token, dim)?;
                read_element(storage, offset)
            })
            .collect()
    }

    /// Overwrite one block; `values` follows [`CacheConfig::block_layout`].
    pub fn update_block(
        &mut self,
        kind: CacheKind,
        layer_id: usize,
        head_id: usize,
        block_id: &[i64],
        values: &[f32],
    ) -> Result<(), AccessError> {
        let expected = self.config.block_size * self.config.head_dim;
        check_len(expected, values.len())?;
        let target = self.resolve(layer_id, head_id, block_id, false)?;
        let offsets = self
            .block_coords()
            .map(|(token, dim)| self.element_offset(kind, layer_id, &target, token, dim))
            .collect::<Result<Vec<_>, _>>()?;
        self.store(target.storage, &offsets, values)
    }

    /// Read the `head_dim` values stored at one slot.
    pub fn get_slot(
        &self,
        kind: CacheKind,
        layer_id: usize,
        head_id: usize,
        slot_id: &[i64],
    ) -> Result<Vec<f32>, AccessError> {
        let target = self.resolve(layer_id, head_id, slot_id, true)?;
        let storage = self.storage(target.storage)?;
        (0..self.config.head_dim)
            .map(|dim| -> Result<f32, AccessError> {
                let offset = self.element_offset(kind, layer_id, &target, target.token, dim)?;
                read_element(storage, offset)
            })
            .collect()
    }

    /// Write the `head_dim` values of one slot.
    pub fn update_slot(
        &mut self,
        kind: CacheKind,
        layer_id: usize,
        head_id: usize,
        slot_id: &[i64],
        values: &[f32],
    ) -> Result<(), AccessError> {
        check_len(self.config.head_dim, values.len())?;
        let target = self.resolve(layer_id, head_id, slot_id, true)?;
        self.write_slot(kind, layer_id, &target, values)
    }

    /// Scatter one `head_dim` row per slot. `slot_ids` is shaped like the
    /// slot mapping (`[n, addr_width]`) and `values` holds `n * head_dim`
    /// elements. Nothing is written unless every slot resolves.
    pub fn update_slots(
        &mut self,
        kind: CacheKind,
        layer_id: usize,
        head_id: usize,
        slot_ids: &IndexTensor,
        values: &[f32],
    ) -> Result<(), AccessError> {
        let addr_width = self.config.addr_width();
        if slot_ids.shape().len() != 2 || slot_ids.shape()[1] != addr_width {
            return Err(AccessError::SlotTensorShape {
                shape: slot_ids.shape().to_vec(),
                addr_width,
            });
        }
        let head_dim = self.config.head_dim;
        check_len(slot_ids.len() * head_dim, values.len())?;

        let targets = slot_ids
            .rows()
            .map(|row| self.resolve(layer_id, head_id, row, true))
            .collect::<Result<Vec<_>, _>>()?;

        for (target, chunk) in targets.iter().zip(values.chunks_exact(head_dim)) {
            self.write_slot(kind, layer_id, target, chunk)?;
        }
        Ok(())
    }

    fn write_slot(
        &mut self,
        kind: CacheKind,
        layer_id: usize,
        target: &Target,
        values: &[f32],
    ) -> Result<(), AccessError> {
        let offsets = (0..self.config.head_dim)
            .map(|dim| self.element_offset(kind, layer_id, target, target.token, dim))
            .collect::<Result<Vec<_>, _>>()?;
        self.store(target.storage, &offsets, values)
    }

    fn storage(&self, index: usize) -> Result<&KvStorage, AccessError> {
        let count = self.storages.len();
        self.storages
            .get(index)
            .ok_or(AccessError::MissingStorage { index, count })
    }

    /// Write `values` at `offsets`, or nothing if any offset is out of range.
    fn store(
        &mut self,
        index: usize,
        offsets: &[usize],
        values: &[f32],
    ) -> Result<(), AccessError> {
        let count = self.storages.len();
        let storage = self
            .storages
            .get_mut(index)
            .ok_or(AccessError::MissingStorage { index, count })?;
        let len = storage.num_elements();
        if let Some(&offset) = offsets.iter().find(|&&o| o >= len) {
            return Err(AccessError::OffsetOutOfRange { offset, len });
        }
        for (&offset, value) in offsets.iter().zip(values) {
            if !storage.write(offset, *value) {
                return Err(AccessError::OffsetOutOfRange { offset, len });
            }
        }
        Ok(())
    }

    /// `(token, dim)` pairs of one block in block-layout order.
    fn block_coords(&self) -> impl Iterator<Item = (usize, usize)> {
        let block_size = self.config.block_size;
        let head_dim = self.config.head_dim;
        let token_major = self.layout.token_major;
        (0..block_size * head_dim).map(move |i| {
            if token_major {
                (i / head_dim, i % head_dim)
            } else {
                (i % block_size, i / block_size)
            }
        })
    }

    fn element_offset(
        &self,
        kind: CacheKind,
        layer_id: usize,
        target: &Target,
        token: usize,
        dim: usize,
    ) -> Result<usize, AccessError> {
        self.layout.offset(&LocalCoords {
            block: target.block,
            layer: layer_id,
            kv: kind.index(),
            token,
            head: target.head,
            dim,
        })
    }

    fn resolve(
        &self,
        layer_id: usize,
        head_id: usize,
        id: &[i64],
        is_slot: bool,
    ) -> Result<Target, AccessError> {
        let expected = self.config.addr_width();
        let addr = PhysicalAddress::new(id)
            .filter(|a| a.width() == expected)
            .ok_or(AccessError::AddressWidth {
                expected,
                got: id.len(),
            })?;

        if layer_id >= self.config.num_layers {
            return Err(AccessError::LayerOutOfRange {
                layer: layer_id,
                num_layers: self.config.num_layers,
            });
        }
        if head_id >= self.config.num_kv_heads {
            return Err(AccessError::HeadOutOfRange {
                head: head_id,
                num_heads: self.config.num_kv_heads,
            });
        }

        let local_heads = self.layout.local_extent(DimKind::NumKvHeads).max(1);
        let mut storage = 0usize;
        let mut head = head_id;
        for ((&coord, shard), &parallelism) in addr
            .shard_coords()
            .iter()
            .zip(&self.config.sharding)
            .zip(self.layout.topology())
        {
            let out_of_range = AccessError::ShardOutOfRange {
                axis: shard.axis,
                coord,
                parallelism,
            };
            let index = if shard.axis == DimKind::NumKvHeads && coord == UNSHARDED {
                head = head_id % local_heads;
                head_id / local_heads
            } else {
                usize::try_from(coord).map_err(|_| out_of_range.clone())?
            };
            if index >= parallelism {
                return Err(out_of_range);
            }
            storage = storage * parallelism + index;
        }

        let local = usize::try_from(addr.local_id()).map_err(|_| AccessError::LocalOutOfRange {
            axis: if is_slot {
                DimKind::BlockSize
            } else {
                DimKind::NumBlocks
            },
            index: addr.local_id(),
            extent: 0,
        })?;
        let (block, token) = if is_slot {
            (local / self.config.block_size, local % self.config.block_size)
        } else {
            (local, 0)
        };

        Ok(Target {
            storage,
            block,
            token,
            head,
        })
    }
}

fn read_element(storage: &KvStorage, offset: usize) -> Result<f32, AccessError> {
    storage.read(offset).ok_or(AccessError::OffsetOutOfRange {
        offset,
        len: storage.num_elements(),
    })
}

fn check_len(expected: usize, got: usize) -> Result<(), AccessError> {
    if expected != got {
        return Err(AccessError::ValueLength { expected, got });
    }
    Ok(())
}
