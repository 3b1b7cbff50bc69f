//! Prometheus metrics for the scheduler.
//!
//! Everything is registered on a private [`Registry`] so several schedulers
//! (or tests) can coexist in one process.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::cache::kv_cache::BatchMetadata;
use crate::cache::scheduler::SchedulerError;

/// Counters and gauges for one scheduler.
#[derive(Clone)]
pub struct SchedulerMetrics {
    registry: Registry,
    schedule_calls: IntCounter,
    scheduled_tokens: IntCounter,
    schedule_errors: IntCounterVec,
    sessions: IntGauge,
    batch_size: Histogram,
}

impl SchedulerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let schedule_calls = IntCounter::new(
            "paged_kv_schedule_calls_total",
            "Successful schedule calls",
        )?;
        let scheduled_tokens = IntCounter::new(
            "paged_kv_scheduled_tokens_total",
            "Tokens given a slot across all schedule calls",
        )?;
        let schedule_errors = IntCounterVec::new(
            Opts::new("paged_kv_schedule_errors_total", "Refused schedule calls"),
            &["kind"],
        )?;
        let sessions = IntGauge::new("paged_kv_sessions", "Sessions known to the scheduler")?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("paged_kv_batch_sequences", "Sequences per scheduled batch")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0]),
        )?;

        registry.register(Box::new(schedule_calls.clone()))?;
        registry.register(Box::new(scheduled_tokens.clone()))?;
        registry.register(Box::new(schedule_errors.clone()))?;
        registry.register(Box::new(sessions.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;

        Ok(Self {
            registry,
            schedule_calls,
            scheduled_tokens,
            schedule_errors,
            sessions,
            batch_size,
        })
    }

    /// Record a successfully published batch.
    pub fn observe_batch(&self, batch: &BatchMetadata) {
        self.schedule_calls.inc();
        self.scheduled_tokens.inc_by(batch.num_tokens() as u64);
        self.batch_size.observe(batch.num_seqs() as f64);
    }

    /// Record a refused batch, labelled by error kind.
    pub fn observe_error(&self, err: &SchedulerError) {
        self.schedule_errors
            .with_label_values(&[err.kind().as_str()])
            .inc();
    }

    pub fn set_sessions(&self, count: usize) {
        self.sessions.set(count as i64);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
