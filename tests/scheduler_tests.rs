//! Integration tests for the paged KV-cache scheduler.

use paged_kv_sched::cache::address::{Hierarchy, ShardingError, UNSHARDED};
use paged_kv_sched::cache::attention::{CacheConfig, DimKind, ShardingAxis};
use paged_kv_sched::cache::scheduler::{ErrorKind, Scheduler, SchedulerError};
use paged_kv_sched::cache::tensor::{DType, IndexTensor};

/// block_size 16, 4 blocks (64 slots), max_model_len 32, unsharded.
fn scenario_scheduler() -> Scheduler {
    let cfg = CacheConfig::new(2, 2, 8, DType::F16, 16);
    Scheduler::new(cfg, 4, 32, Hierarchy::default()).unwrap()
}

fn sharded_config() -> CacheConfig {
    CacheConfig::new(2, 8, 4, DType::F32, 4).with_sharding(vec![
        ShardingAxis::new(DimKind::NumBlocks, vec![0]),
        ShardingAxis::new(DimKind::NumKvHeads, vec![1]),
    ])
}

fn rows(t: &IndexTensor) -> Vec<Vec<i64>> {
    t.rows().map(|r| r.to_vec()).collect()
}

#[test]
fn test_first_prefill() {
    let mut sched = scenario_scheduler();
    let snap = sched.schedule(&[0], &[5]).unwrap();

    assert_eq!(snap.num_seqs(), 1);
    assert_eq!(snap.num_tokens(), 5);
    assert_eq!(snap.context_lens().as_slice(), &[0]);
    assert_eq!(snap.seq_lens().as_slice(), &[5]);
    assert_eq!(snap.block_table().shape(), &[1, 1, 1]);
    assert_eq!(snap.block_table().as_slice(), &[0]);
    assert_eq!(rows(snap.slot_mapping()), vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
    assert_eq!(snap.conversation_id(), 1);

    assert_eq!(sched.session(0).unwrap().context_len, 5);
}

#[test]
fn test_decode_continues_window() {
    let mut sched = scenario_scheduler();
    sched.schedule(&[0], &[5]).unwrap();
    let snap = sched.schedule(&[0], &[3]).unwrap();

    assert_eq!(snap.context_lens().as_slice(), &[5]);
    assert_eq!(snap.seq_lens().as_slice(), &[8]);
    assert_eq!(rows(snap.slot_mapping()), vec![vec![5], vec![6], vec![7]]);
    assert_eq!(snap.block_table().shape(), &[1, 1, 1]);
    assert_eq!(snap.conversation_id(), 2);

    assert_eq!(sched.session(0).unwrap().context_len, 8);
}

#[test]
fn test_capacity_exhausted() {
    let mut sched = scenario_scheduler();

    let snap = sched.schedule(&[1], &[1]).unwrap();
    assert_eq!(rows(snap.slot_mapping()), vec![vec![32]]);
    assert_eq!(rows(snap.block_table()), vec![vec![2]]);
    let state = *sched.session(1).unwrap();
    assert_eq!((state.slot_start, state.slot_end), (32, 64));

    let err = sched.schedule(&[2], &[1]).unwrap_err();
    assert_eq!(
        err,
        SchedulerError::Capacity {
            session_id: 2,
            slot_end: 96,
            capacity: 64
        }
    );
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert!(sched.session(2).is_none());
    assert_eq!(sched.batch().conversation_id(), 1);
}

#[test]
fn test_overflow_rejected() {
    let mut sched = scenario_scheduler();
    sched.schedule(&[0], &[30]).unwrap();

    let err = sched.schedule(&[0], &[3]).unwrap_err();
    assert_eq!(
        err,
        SchedulerError::Overflow {
            session_id: 0,
            seq_len: 33,
            max_model_len: 32
        }
    );
    assert_eq!(err.kind(), ErrorKind::Overflow);
    assert_eq!(sched.session(0).unwrap().context_len, 30);

    // Exactly filling the window is fine.
    let snap = sched.schedule(&[0], &[2]).unwrap();
    assert_eq!(snap.seq_lens().as_slice(), &[32]);
    assert_eq!(snap.block_table().shape(), &[1, 2, 1]);
}

#[test]
fn test_ragged_batch_zero_padding() {
    let mut sched = scenario_scheduler();
    let snap = sched.schedule(&[0, 1], &[20, 3]).unwrap();

    assert_eq!(snap.num_seqs(), 2);
    assert_eq!(snap.num_tokens(), 23);
    assert_eq!(snap.block_table().shape(), &[2, 2, 1]);
    // Session 1's window starts at logical block 2; its unused second row is padding.
    assert_eq!(rows(snap.block_table()), vec![vec![0], vec![1], vec![2], vec![0]]);

    let slots = rows(snap.slot_mapping());
    assert_eq!(slots.len(), 23);
    assert_eq!(slots[19], vec![19]);
    assert_eq!(slots[20], vec![32]);
    assert_eq!(slots[22], vec![34]);
}

#[test]
fn test_slot_mapping_matches_query_lens() {
    let mut sched = scenario_scheduler();
    let steps: [(Vec<u64>, Vec<usize>); 4] = [
        (vec![0, 1], vec![4, 7]),
        (vec![1], vec![1]),
        (vec![0, 1], vec![0, 2]),
        (vec![], vec![]),
    ];
    for (ids, lens) in steps {
        let snap = sched.schedule(&ids, &lens).unwrap();
        let total: usize = lens.iter().sum();
        assert_eq!(snap.slot_mapping().len(), total);
        assert_eq!(snap.num_tokens(), total);
        assert_eq!(snap.num_seqs(), ids.len());
    }
    assert_eq!(sched.session(0).unwrap().context_len, 4);
    assert_eq!(sched.session(1).unwrap().context_len, 10);
    assert_eq!(sched.batch().conversation_id(), 4);
}

#[test]
fn test_context_len_monotonic_and_window_stable() {
    let mut sched = scenario_scheduler();
    let mut last = 0;
    for step in 0..8usize {
        let query_len = step % 3;
        sched.schedule(&[1], &[query_len]).unwrap();
        let state = *sched.session(1).unwrap();
        assert!(state.context_len >= last);
        assert_eq!((state.slot_start, state.slot_end), (32, 64));
        last = state.context_len;
    }
    assert_eq!(last, 7);
}

#[test]
fn test_zero_length_query_creates_session() {
    let mut sched = scenario_scheduler();
    let snap = sched.schedule(&[1], &[0]).unwrap();
    assert_eq!(snap.num_tokens(), 0);
    assert_eq!(snap.block_table().shape(), &[1, 0, 1]);
    assert_eq!(sched.session(1).unwrap().context_len, 0);
}

#[test]
fn test_failed_batch_keeps_previous_snapshot() {
    let mut sched = scenario_scheduler();
    sched.schedule(&[0, 1], &[2, 2]).unwrap();
    let before = sched.batch().clone();

    // Session 0 would succeed, session 1 overflows.
    assert!(sched.schedule(&[0, 1], &[1, 40]).is_err());

    assert_eq!(sched.batch().conversation_id(), before.conversation_id());
    assert_eq!(sched.batch().slot_mapping(), before.slot_mapping());
    assert_eq!(sched.session(0).unwrap().context_len, 2);
    assert_eq!(sched.session(1).unwrap().context_len, 2);
}

#[test]
fn test_sharded_schedule() {
    let hierarchy = Hierarchy::new(vec![2, 4]).unwrap();
    let mut sched = Scheduler::new(sharded_config(), 8, 8, hierarchy).unwrap();
    assert_eq!(sched.storage_count(), 8);
    assert_eq!(sched.layout().local_shape(), &[4, 2, 2, 4, 2, 4]);

    // Session 2 owns logical slots 16..24, the first half of shard 1.
    let snap = sched.schedule(&[2], &[6]).unwrap();
    assert_eq!(snap.block_table().shape(), &[1, 2, 3]);
    assert_eq!(
        rows(snap.block_table()),
        vec![vec![1, UNSHARDED, 0], vec![1, UNSHARDED, 1]]
    );
    let slots = rows(snap.slot_mapping());
    assert_eq!(slots[0], vec![1, UNSHARDED, 0]);
    assert_eq!(slots[5], vec![1, UNSHARDED, 5]);
    assert_eq!(snap.kv_caches().len(), 8);
}

#[test]
fn test_uneven_shard_surfaces_on_schedule() {
    let hierarchy = Hierarchy::new(vec![3, 4]).unwrap();
    let mut sched = Scheduler::new(sharded_config(), 8, 8, hierarchy).unwrap();

    let err = sched.schedule(&[0], &[1]).unwrap_err();
    assert_eq!(
        err,
        SchedulerError::Sharding(ShardingError::UnevenShard {
            num_blocks: 8,
            parallelism: 3
        })
    );
    assert_eq!(err.kind(), ErrorKind::Sharding);
    assert!(sched.sessions().is_empty());
}

#[test]
fn test_unsupported_sharding_axis() {
    let cfg = CacheConfig::new(2, 2, 4, DType::F32, 4)
        .with_sharding(vec![ShardingAxis::new(DimKind::NumLayers, vec![0])]);
    let mut sched = Scheduler::new(cfg, 4, 8, Hierarchy::new(vec![2]).unwrap()).unwrap();

    let err = sched.schedule(&[0], &[1]).unwrap_err();
    assert_eq!(
        err,
        SchedulerError::Sharding(ShardingError::UnsupportedAxis(DimKind::NumLayers))
    );
}

#[test]
fn test_bad_policy_rejected_at_construction() {
    let cfg = CacheConfig::new(2, 2, 4, DType::F32, 4)
        .with_sharding(vec![ShardingAxis::new(DimKind::NumBlocks, vec![2])]);
    let err = Scheduler::new(cfg, 4, 8, Hierarchy::new(vec![2]).unwrap()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sharding);
}

#[test]
fn test_huge_session_id() {
    let mut sched = scenario_scheduler();
    let err = sched.schedule(&[u64::MAX], &[1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
}
