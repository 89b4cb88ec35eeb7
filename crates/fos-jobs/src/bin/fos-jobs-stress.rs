//! fOS Jobs - Stress Driver
//!
//! Usage: cargo run --features stress --bin fos-jobs-stress -- [workers] [jobs]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, bail};
use fos_jobs::{Scheduler, SchedulerConfig};
use tracing_subscriber::EnvFilter;

fn parse_arg(position: usize, default: u64) -> anyhow::Result<u64> {
    match std::env::args().nth(position) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("argument {position} is not a number: {raw}")),
        None => Ok(default),
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let workers = usize::try_from(parse_arg(1, 4)?)?;
    let jobs = parse_arg(2, 10_000)?;

    let scheduler = Scheduler::new(SchedulerConfig::default().with_worker_threads(workers))?;
    let counter = Arc::new(AtomicU64::new(0));

    let started = Instant::now();
    for _ in 0..jobs {
        let counter = Arc::clone(&counter);
        scheduler.submit(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }
    let submitted = started.elapsed();

    // Help drain instead of sleeping
    while scheduler.completed_work() < jobs {
        if !scheduler.try_cooperate() {
            std::thread::yield_now();
        }
    }
    let drained = started.elapsed();

    let total = counter.load(Ordering::SeqCst);
    if total != jobs {
        bail!("expected {jobs} increments, counted {total}");
    }

    tracing::info!(
        workers,
        jobs,
        submit_us = submitted.as_micros() as u64,
        total_us = drained.as_micros() as u64,
        "Stress run finished"
    );

    scheduler.shutdown();
    Ok(())
}
