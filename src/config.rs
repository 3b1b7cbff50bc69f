//! Runtime configuration for paged-kv-sched.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! The file carries the attention cache description and the scheduler's
//! pool sizing; every section falls back to defaults when absent.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::address::{Hierarchy, ShardingError};
use crate::cache::attention::{AttentionConfig, ConfigError, DimKind};
use crate::cache::scheduler::SchedulerError;
use crate::cache::tensor::MemoryPool;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "paged-kv-sched",
    about = "Replay schedule traces against a paged KV-cache scheduler"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Path to the trace of schedule steps (JSON).
    #[arg(short, long)]
    pub trace: PathBuf,

    /// Print the metrics registry (prometheus text format) after the replay.
    #[arg(long)]
    pub metrics: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    pub json_logs: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pool sizing and device mesh.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Cache tensor description.
    #[serde(default)]
    pub attention: AttentionConfig,
}

/// Scheduler pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Physical blocks in the pool (0 = derive from `memory_budget`).
    pub num_blocks: usize,

    /// Logical window reserved per session, in tokens.
    pub max_model_len: usize,

    /// Device mesh the cache is sharded over.
    pub hierarchy: Hierarchy,

    /// Memory pool for storage and metadata tensors.
    pub storage_pool: MemoryPool,

    /// Byte budget for the whole pool, used when `num_blocks` is 0.
    pub memory_budget: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_blocks: 0,
            max_model_len: 2048,
            hierarchy: Hierarchy::default(),
            storage_pool: MemoryPool::Shared,
            memory_budget: 1024 * 1024 * 1024, // 1 GB
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Block count for the pool: explicit, or as many blocks as fit in the
    /// memory budget, rounded down to a multiple of the block-axis parallelism.
    pub fn resolved_num_blocks(&self) -> Result<usize, SchedulerError> {
        if self.scheduler.num_blocks > 0 {
            return Ok(self.scheduler.num_blocks);
        }

        let cache = self.attention.as_paged()?;
        let block_bytes = cache
            .block_bytes()
            .ok_or(ConfigError::SizeOverflow("block_bytes"))?;
        if block_bytes == 0 {
            return Err(ConfigError::ZeroDimension("block_bytes").into());
        }

        let mut parallelism = 1usize;
        for axis in cache.sharding.iter().filter(|s| s.axis == DimKind::NumBlocks) {
            let factor = self.scheduler.hierarchy.parallelism(&axis.policy)?;
            parallelism = parallelism
                .checked_mul(factor)
                .ok_or_else(|| ShardingError::ParallelismOverflow(axis.policy.clone()))?;
        }

        let blocks = self.scheduler.memory_budget / block_bytes;
        let blocks = blocks - blocks % parallelism;
        if blocks == 0 {
            return Err(ConfigError::ZeroDimension("num_blocks").into());
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::attention::{CacheConfig, ShardingAxis};
    use crate::cache::tensor::DType;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.scheduler.max_model_len, 2048);
        assert_eq!(cfg.scheduler.storage_pool, MemoryPool::Shared);
        assert_eq!(cfg.attention.as_paged().unwrap().block_size, 16);
    }

    #[test]
    fn test_num_blocks_from_budget() {
        let mut cfg = Config::default();
        // 32 layers * 8 heads * 128 dim * 16 tokens * K+V * fp16 = 2 MB per block
        assert_eq!(cfg.resolved_num_blocks().unwrap(), 512);

        cfg.scheduler.num_blocks = 7;
        assert_eq!(cfg.resolved_num_blocks().unwrap(), 7);
    }

    #[test]
    fn test_budget_rounds_to_parallelism() {
        let cache = CacheConfig::new(1, 1, 8, DType::F32, 4)
            .with_sharding(vec![ShardingAxis::new(DimKind::NumBlocks, vec![0])]);
        let cfg = Config {
            scheduler: SchedulerConfig {
                hierarchy: Hierarchy::new(vec![4]).unwrap(),
                // one block = 4 * 8 * 2 * 4 bytes = 256; 10 blocks fit, 8 are kept
                memory_budget: 256 * 10 + 100,
                ..Default::default()
            },
            attention: AttentionConfig::Paged(cache),
        };
        assert_eq!(cfg.resolved_num_blocks().unwrap(), 8);
    }

    #[test]
    fn test_budget_too_small() {
        let cfg = Config {
            scheduler: SchedulerConfig {
                memory_budget: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            cfg.resolved_num_blocks(),
            Err(SchedulerError::Config(ConfigError::ZeroDimension("num_blocks")))
        );
    }

    #[test]
    fn test_budget_with_oversized_block() {
        let cache = CacheConfig::new(1 << 40, 1 << 20, 1 << 10, DType::F32, 16);
        let cfg = Config {
            attention: AttentionConfig::Paged(cache),
            ..Default::default()
        };
        assert_eq!(
            cfg.resolved_num_blocks(),
            Err(SchedulerError::Config(ConfigError::SizeOverflow("block_bytes")))
        );
    }

    #[test]
    fn test_budget_with_bad_block_policy() {
        let cache = CacheConfig::new(1, 1, 8, DType::F32, 4)
            .with_sharding(vec![ShardingAxis::new(DimKind::NumBlocks, vec![2])]);
        let cfg = Config {
            scheduler: SchedulerConfig {
                hierarchy: Hierarchy::new(vec![4]).unwrap(),
                ..Default::default()
            },
            attention: AttentionConfig::Paged(cache),
        };
        assert_eq!(
            cfg.resolved_num_blocks(),
            Err(SchedulerError::Sharding(ShardingError::PolicyOutOfRange {
                index: 2,
                rank: 1
            }))
        );
    }
}
