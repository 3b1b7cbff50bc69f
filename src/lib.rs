//! paged-kv-sched: batch scheduling over a paged, sharded KV cache.
//!
//! Maps the tokens of each decode/prefill step onto fixed-size blocks of a
//! preallocated cache pool and hands the attention kernel:
//!   block tables + slot mappings (physical addresses) + per-shard storage
//!
//! Storage may be partitioned over a device mesh along the block axis and
//! the KV-head axis; addresses carry one shard coordinate per sharded axis.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod trace;

pub use cache::address::{AddressTranslator, Hierarchy, PhysicalAddress, UNSHARDED};
pub use cache::attention::{AttentionConfig, CacheConfig, DimKind, ShardingAxis};
pub use cache::kv_cache::{BatchMetadata, CacheKind, PagedKvCache};
pub use cache::scheduler::{ErrorKind, Scheduler, SchedulerError};
pub use cache::tensor::{DType, IndexTensor, KvStorage, MemoryPool};
