//! Trace replay: a recorded sequence of schedule steps and the per-step
//! report the binary prints.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::kv_cache::PagedKvCache;
use crate::cache::scheduler::SchedulerError;
use crate::cache::session::SessionId;
use crate::cache::tensor::IndexTensor;

/// One `schedule()` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    pub session_ids: Vec<SessionId>,
    pub query_lens: Vec<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    pub steps: Vec<TraceStep>,
}

impl Trace {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let trace: Trace = serde_json::from_str(&data)?;
        Ok(trace)
    }
}

/// Outcome of one replayed step, serialized as one JSON line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StepReport {
    Scheduled {
        step: usize,
        conversation_id: u64,
        num_seqs: usize,
        num_tokens: usize,
        context_lens: Vec<i64>,
        seq_lens: Vec<i64>,
        block_table: Vec<Vec<Vec<i64>>>,
        slot_mapping: Vec<Vec<i64>>,
    },
    Refused {
        step: usize,
        error: String,
        kind: &'static str,
    },
}

impl StepReport {
    pub fn scheduled(step: usize, cache: &PagedKvCache<'_>) -> Self {
        let block_table = cache.block_table();
        let max_blocks = block_table.shape().get(1).copied().unwrap_or(0).max(1);
        let rows = rows_of(block_table);
        StepReport::Scheduled {
            step,
            conversation_id: cache.conversation_id(),
            num_seqs: cache.num_seqs(),
            num_tokens: cache.num_tokens(),
            context_lens: cache.context_lens().as_slice().to_vec(),
            seq_lens: cache.seq_lens().as_slice().to_vec(),
            block_table: if block_table.shape().get(1) == Some(&0) {
                vec![Vec::new(); cache.num_seqs()]
            } else {
                rows.chunks(max_blocks).map(<[_]>::to_vec).collect()
            },
            slot_mapping: rows_of(cache.slot_mapping()),
        }
    }

    pub fn refused(step: usize, err: &SchedulerError) -> Self {
        StepReport::Refused {
            step,
            error: err.to_string(),
            kind: err.kind().as_str(),
        }
    }
}

fn rows_of(tensor: &IndexTensor) -> Vec<Vec<i64>> {
    tensor.rows().map(<[i64]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::address::Hierarchy;
    use crate::cache::attention::CacheConfig;
    use crate::cache::scheduler::Scheduler;
    use crate::cache::tensor::DType;

    #[test]
    fn test_trace_parse() {
        let json = r#"{"steps": [{"session_ids": [0, 1], "query_lens": [5, 3]}]}"#;
        let trace: Trace = serde_json::from_str(json).unwrap();
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.steps[0].session_ids, vec![0, 1]);
    }

    #[test]
    fn test_step_report_shapes() {
        let cfg = CacheConfig::new(1, 1, 4, DType::F32, 4);
        let mut sched = Scheduler::new(cfg, 8, 16, Hierarchy::default()).unwrap();

        let snap = sched.schedule(&[0, 1], &[5, 2]).unwrap();
        let report = StepReport::scheduled(0, &snap);
        match report {
            StepReport::Scheduled {
                block_table,
                slot_mapping,
                ..
            } => {
                assert_eq!(block_table, vec![vec![vec![0], vec![1]], vec![vec![4], vec![0]]]);
                assert_eq!(slot_mapping.len(), 7);
                assert_eq!(slot_mapping[5], vec![16]);
            }
            other => panic!("unexpected report: {:?}", other),
        }

        let err = sched.schedule(&[0], &[12]).unwrap_err();
        let line = serde_json::to_string(&StepReport::refused(1, &err)).unwrap();
        assert!(line.contains(r#""kind":"overflow""#));
    }

    #[test]
    fn test_empty_batch_report() {
        let cfg = CacheConfig::new(1, 1, 4, DType::F32, 4);
        let mut sched = Scheduler::new(cfg, 8, 16, Hierarchy::default()).unwrap();
        let snap = sched.schedule(&[], &[]).unwrap();
        let line = serde_json::to_string(&StepReport::scheduled(0, &snap)).unwrap();
        assert!(line.contains(r#""block_table":[]"#));
    }
}
