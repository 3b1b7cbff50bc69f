//! Paged KV-cache scheduling.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`tensor`]: IndexTensor, KvStorage, DType, MemoryPool
//! - [`attention`]: CacheConfig, AttentionConfig, dimension kinds and sharding axes
//! - [`session`]: Per-session logical windows and decode progress
//! - [`address`]: Device hierarchy and logical → physical address translation
//! - [`kv_cache`]: Batch descriptor, shard layout and the PagedKvCache snapshot
//! - [`scheduler`]: The Scheduler that builds block tables and slot mappings

pub mod address;
pub mod attention;
pub mod kv_cache;
pub mod scheduler;
pub mod session;
pub mod tensor;
