//! The paged KV-cache scheduler.
//!
//! Owns the per-shard backing storage, the session table and the single
//! persistent batch descriptor. Each [`Scheduler::schedule`] call:
//! 1. Plans every session in the batch (window, context, projected length)
//!    and rejects the whole batch on capacity or overflow
//! 2. Builds a fresh block table (right-padded with zeros)
//! 3. Builds a fresh slot mapping for the new tokens
//! 4. Commits session progress and publishes the new batch descriptor
//!
//! Nothing is committed until every step has succeeded.

use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::address::{AddressTranslator, Hierarchy, ShardingError};
use crate::cache::attention::{AttentionConfig, CacheConfig, ConfigError};
use crate::cache::kv_cache::{BatchMetadata, PagedKvCache, ShardLayout};
use crate::cache::session::{SessionError, SessionId, SessionState, SessionTable};
use crate::cache::tensor::{IndexTensor, KvStorage, MemoryPool};
use crate::config::Config;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sharding error: {0}")]
    Sharding(#[from] ShardingError),

    #[error("Session {session_id} window ends at slot {slot_end}, beyond capacity of {capacity} slots")]
    Capacity {
        session_id: SessionId,
        slot_end: usize,
        capacity: usize,
    },

    #[error("Logical window of session {session_id} is not addressable")]
    WindowOverflow { session_id: SessionId },

    #[error("Session {session_id} would reach {seq_len} tokens, beyond max_model_len {max_model_len}")]
    Overflow {
        session_id: SessionId,
        seq_len: usize,
        max_model_len: usize,
    },

    #[error("Batch has {session_ids} session ids but {query_lens} query lengths")]
    LengthMismatch { session_ids: usize, query_lens: usize },

    #[error("Session {0} appears more than once in the batch")]
    DuplicateSession(SessionId),
}

impl From<SessionError> for SchedulerError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::WindowOverflow { session_id } => {
                SchedulerError::WindowOverflow { session_id }
            }
        }
    }
}

/// Coarse classification so callers can react without matching messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The scheduler cannot be built; reconfigure.
    Configuration,
    /// The session's window does not fit in physical storage; reject or reclaim.
    Capacity,
    /// The session would grow past `max_model_len`; reject the request.
    Overflow,
    /// Config and hierarchy disagree; not retryable.
    Sharding,
    /// Malformed batch arguments.
    InvalidArgument,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Overflow => "overflow",
            ErrorKind::Sharding => "sharding",
            ErrorKind::InvalidArgument => "invalid_argument",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Config(_) => ErrorKind::Configuration,
            SchedulerError::Sharding(_) => ErrorKind::Sharding,
            SchedulerError::Capacity { .. } | SchedulerError::WindowOverflow { .. } => {
                ErrorKind::Capacity
            }
            SchedulerError::Overflow { .. } => ErrorKind::Overflow,
            SchedulerError::LengthMismatch { .. } | SchedulerError::DuplicateSession(_) => {
                ErrorKind::InvalidArgument
            }
        }
    }
}

/// One session's projected progress for the batch being built.
#[derive(Debug, Clone, Copy)]
struct Plan {
    session_id: SessionId,
    state: SessionState,
    seq_len: usize,
}

/// Deterministic, single-threaded batch-address allocator over a fixed
/// pool of paged KV storage.
#[derive(Debug)]
pub struct Scheduler {
    /// Validated cache description.
    config: CacheConfig,

    /// Device mesh the sharding policies index into.
    hierarchy: Hierarchy,

    /// Physical blocks in the pool, across all shards.
    num_blocks: usize,

    /// Logical window per session, in slots; a multiple of `block_size`.
    max_model_len: usize,

    /// `num_blocks * block_size`, checked to fit `i64` at construction.
    capacity_slots: usize,

    /// Pool the metadata tensors are allocated from.
    pool: MemoryPool,

    /// Shard topology and per-shard storage shape.
    layout: ShardLayout,

    /// One storage handle per shard, row-major over the topology.
    storages: Vec<KvStorage>,

    /// Per-session windows and progress. Only a successful schedule mutates it.
    sessions: SessionTable,

    /// Last published batch; overwritten in place by the next schedule.
    batch: BatchMetadata,
}

impl Scheduler {
    /// Build a scheduler whose buffers live in the shared host-visible pool.
    pub fn new(
        config: CacheConfig,
        num_blocks: usize,
        max_model_len: usize,
        hierarchy: Hierarchy,
    ) -> Result<Self, SchedulerError> {
        Self::with_pool(config, num_blocks, max_model_len, hierarchy, MemoryPool::Shared)
    }

    pub fn with_pool(
        config: CacheConfig,
        num_blocks: usize,
        max_model_len: usize,
        hierarchy: Hierarchy,
        pool: MemoryPool,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        if num_blocks == 0 {
            return Err(ConfigError::ZeroDimension("num_blocks").into());
        }
        if max_model_len == 0 {
            return Err(ConfigError::ZeroDimension("max_model_len").into());
        }
        if max_model_len % config.block_size != 0 {
            return Err(ConfigError::UnalignedModelLen {
                max_model_len,
                block_size: config.block_size,
            }
            .into());
        }
        let capacity_slots = num_blocks
            .checked_mul(config.block_size)
            .filter(|c| i64::try_from(*c).is_ok() && i64::try_from(max_model_len).is_ok())
            .ok_or(ConfigError::CapacityOverflow {
                num_blocks,
                block_size: config.block_size,
            })?;

        let layout = ShardLayout::new(&config, &hierarchy, num_blocks)?;
        let num_shards = layout.num_shards()?;
        let storage_bytes = layout
            .local_elements()
            .checked_mul(config.dtype.size_in_bytes())
            .and_then(|b| b.checked_mul(num_shards))
            .ok_or(ConfigError::SizeOverflow("kv storage"))?;
        let storages: Vec<KvStorage> = (0..num_shards)
            .map(|_| KvStorage::zeros(layout.local_shape(), config.dtype, pool))
            .collect();

        info!(
            num_blocks,
            block_size = config.block_size,
            max_model_len,
            dtype = %config.dtype,
            shards = num_shards,
            local_shape = ?layout.local_shape(),
            storage_bytes,
            "Paged KV storage allocated"
        );

        let batch = BatchMetadata::empty(config.addr_width(), pool);
        Ok(Self {
            config,
            hierarchy,
            num_blocks,
            max_model_len,
            capacity_slots,
            pool,
            layout,
            storages,
            sessions: SessionTable::new(max_model_len),
            batch,
        })
    }

    /// Build from the closed attention config set; only paged configs qualify.
    pub fn from_attention_config(
        attention: AttentionConfig,
        num_blocks: usize,
        max_model_len: usize,
        hierarchy: Hierarchy,
        pool: MemoryPool,
    ) -> Result<Self, SchedulerError> {
        let config = attention.into_paged()?;
        Self::with_pool(config, num_blocks, max_model_len, hierarchy, pool)
    }

    /// Build from the crate configuration file.
    pub fn from_config(config: &Config) -> Result<Self, SchedulerError> {
        let cache = config.attention.as_paged()?;
        Self::with_pool(
            cache.clone(),
            config.resolved_num_blocks()?,
            config.scheduler.max_model_len,
            config.scheduler.hierarchy.clone(),
            config.scheduler.storage_pool,
        )
    }

    /// Schedule one decode/prefill step.
    ///
    /// `session_ids` and `query_lens` pair up by position; ids must be unique
    /// within a call. On error no session and no snapshot field changes.
    pub fn schedule(
        &mut self,
        session_ids: &[SessionId],
        query_lens: &[usize],
    ) -> Result<PagedKvCache<'_>, SchedulerError> {
        if session_ids.len() != query_lens.len() {
            return Err(SchedulerError::LengthMismatch {
                session_ids: session_ids.len(),
                query_lens: query_lens.len(),
            });
        }
        let mut seen = HashSet::with_capacity(session_ids.len());
        if let Some(dup) = session_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(SchedulerError::DuplicateSession(*dup));
        }

        let plans = self.plan(session_ids, query_lens)?;
        let num_seqs = plans.len();
        let num_tokens: usize = query_lens.iter().sum();
        let max_seq_len = plans.iter().map(|p| p.seq_len).max().unwrap_or(0);

        let block_size = self.config.block_size;
        let addr_width = self.config.addr_width();
        let max_blocks = max_seq_len.div_ceil(block_size);
        let translator = AddressTranslator::new(&self.config, &self.hierarchy, self.num_blocks);

        let mut block_table = IndexTensor::zeros(&[num_seqs, max_blocks, addr_width], self.pool);
        let mut rows = block_table.rows_mut();
        for plan in &plans {
            let first_block = plan.state.slot_start / block_size;
            let num_blocks = plan.seq_len.div_ceil(block_size);
            for (j, row) in rows.by_ref().take(max_blocks).enumerate() {
                if j < num_blocks {
                    translator.materialize_block_id(first_block + j, row)?;
                }
            }
        }

        let mut slot_mapping = IndexTensor::zeros(&[num_tokens, addr_width], self.pool);
        let mut rows = slot_mapping.rows_mut();
        for plan in &plans {
            let start = plan.state.slot_start + plan.state.context_len;
            let end = plan.state.slot_start + plan.seq_len;
            for (slot, row) in (start..end).zip(rows.by_ref()) {
                translator.materialize_slot_id(slot, row)?;
            }
        }

        let mut context_lens = IndexTensor::zeros(&[num_seqs], self.pool);
        let mut seq_lens = IndexTensor::zeros(&[num_seqs], self.pool);
        for ((plan, ctx), seq) in plans
            .iter()
            .zip(context_lens.as_mut_slice())
            .zip(seq_lens.as_mut_slice())
        {
            *ctx = to_i64(plan.state.context_len)?;
            *seq = to_i64(plan.seq_len)?;
        }

        for plan in &plans {
            self.sessions.get_or_create(plan.session_id)?.context_len = plan.seq_len;
        }

        let batch = &mut self.batch;
        batch.num_seqs = num_seqs;
        batch.num_tokens = num_tokens;
        batch.context_lens = context_lens;
        batch.seq_lens = seq_lens;
        batch.block_table = block_table;
        batch.slot_mapping = slot_mapping;
        batch.conversation_id = batch.conversation_id.wrapping_add(1);

        debug!(
            conversation_id = batch.conversation_id,
            num_seqs,
            num_tokens,
            max_blocks,
            "Scheduled batch"
        );

        Ok(self.snapshot())
    }

    fn plan(
        &self,
        session_ids: &[SessionId],
        query_lens: &[usize],
    ) -> Result<Vec<Plan>, SchedulerError> {
        let mut plans = Vec::with_capacity(session_ids.len());
        for (&session_id, &query_len) in session_ids.iter().zip(query_lens) {
            let state = self.sessions.window_for(session_id)?;
            if state.slot_end > self.capacity_slots {
                warn!(
                    session_id,
                    slot_end = state.slot_end,
                    capacity = self.capacity_slots,
                    "Session window exceeds physical capacity"
                );
                return Err(SchedulerError::Capacity {
                    session_id,
                    slot_end: state.slot_end,
                    capacity: self.capacity_slots,
                });
            }

            let seq_len = state.context_len.saturating_add(query_len);
            if seq_len > self.max_model_len {
                warn!(
                    session_id,
                    seq_len,
                    max_model_len = self.max_model_len,
                    "Session would exceed max_model_len"
                );
                return Err(SchedulerError::Overflow {
                    session_id,
                    seq_len,
                    max_model_len: self.max_model_len,
                });
            }

            plans.push(Plan {
                session_id,
                state,
                seq_len,
            });
        }
        Ok(plans)
    }

    /// Re-borrow the most recently published snapshot.
    pub fn snapshot(&mut self) -> PagedKvCache<'_> {
        PagedKvCache {
            config: &self.config,
            layout: &self.layout,
            batch: &self.batch,
            storages: &mut self.storages,
            num_blocks: self.num_blocks,
        }
    }

    /// The most recently published batch descriptor.
    pub fn batch(&self) -> &BatchMetadata {
        &self.batch
    }

    /// State of a session that has been scheduled at least once.
    pub fn session(&self, session_id: SessionId) -> Option<&SessionState> {
        self.sessions.get(session_id)
    }

    /// All sessions seen so far.
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// The cache description the scheduler was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Device mesh the storage is sharded over.
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    /// Shard topology and local storage shape.
    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    /// Physical blocks in the pool.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Slots reserved per session.
    pub fn max_model_len(&self) -> usize {
        self.max_model_len
    }

    /// Total physical slots (`num_blocks * block_size`).
    pub fn capacity_slots(&self) -> usize {
        self.capacity_slots
    }

    /// Sessions that fit in physical storage, assuming dense ids from zero.
    pub fn max_sessions(&self) -> usize {
        self.capacity_slots / self.max_model_len
    }

    /// Number of storage handles (one per shard).
    pub fn storage_count(&self) -> usize {
        self.storages.len()
    }

    /// Bytes held by all storage handles.
    pub fn storage_bytes(&self) -> usize {
        self.storages.iter().map(KvStorage::size_in_bytes).sum()
    }
}

fn to_i64(value: usize) -> Result<i64, SchedulerError> {
    i64::try_from(value).map_err(|_| ShardingError::IdOverflow(value).into())
}
