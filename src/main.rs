//! paged-kv-sched: replay a recorded schedule trace.
//!
//! Loads the cache configuration, builds a scheduler and feeds it every step
//! of the trace, printing one JSON line per step to stdout.

use clap::Parser;
use tracing::{error, info, warn};

use paged_kv_sched::cache::scheduler::Scheduler;
use paged_kv_sched::config::{Cli, Config};
use paged_kv_sched::metrics::SchedulerMetrics;
use paged_kv_sched::trace::{StepReport, Trace};

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging. Logs go to stderr; stdout carries the reports.
    let filter = if cli.verbose {
        "paged_kv_sched=debug"
    } else {
        "paged_kv_sched=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("paged-kv-sched v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    let mut scheduler = Scheduler::from_config(&config)?;

    info!(
        num_blocks = scheduler.num_blocks(),
        max_model_len = scheduler.max_model_len(),
        capacity_slots = scheduler.capacity_slots(),
        max_sessions = scheduler.max_sessions(),
        shards = scheduler.storage_count(),
        "Scheduler ready"
    );
    if scheduler.max_sessions() == 0 {
        warn!("No session window fits in the pool; every step will be refused");
    }

    let trace = Trace::load(&cli.trace)?;
    info!(steps = trace.steps.len(), trace = %cli.trace.display(), "Trace loaded");

    let metrics = SchedulerMetrics::new()?;
    let mut refused = 0usize;

    for (step, entry) in trace.steps.iter().enumerate() {
        let report = match scheduler.schedule(&entry.session_ids, &entry.query_lens) {
            Ok(cache) => {
                metrics.observe_batch(cache.batch());
                StepReport::scheduled(step, &cache)
            }
            Err(e) => {
                error!(step, kind = %e.kind(), "Schedule refused: {e}");
                metrics.observe_error(&e);
                refused += 1;
                StepReport::refused(step, &e)
            }
        };
        metrics.set_sessions(scheduler.sessions().len());
        println!("{}", serde_json::to_string(&report)?);
    }

    info!(
        steps = trace.steps.len(),
        refused,
        sessions = scheduler.sessions().len(),
        "Replay complete"
    );

    if cli.metrics {
        print!("{}", metrics.encode()?);
    }

    Ok(())
}
