//! # Job Fanout
//!
//! Splits a parallel sum over the job system: one root job per batch, one
//! child per chunk, children spawning their own children for large chunks.
//!
//! ```bash
//! cargo run --example job_fanout -- --workers 8 --items 1000000 --chunk 4096
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;

use render_graph_engine::job_system::JobContext;
use render_graph_engine::{JobSystem, JobSystemConfig};

#[derive(Parser, Debug)]
#[command(name = "job_fanout", about = "Parallel sum on the work-stealing job system")]
struct Args {
    /// Upper bound on worker threads (never below 2).
    #[arg(long, default_value = "16")]
    workers: usize,

    /// Job records per worker; must be a power of two.
    #[arg(long, default_value = "4096")]
    pool_capacity: usize,

    /// Number of values to sum.
    #[arg(long, default_value = "1000000")]
    items: u64,

    /// Values summed by a single leaf job.
    #[arg(long, default_value = "4096")]
    chunk: u64,
}

struct Shared {
    total: AtomicU64,
    chunk: u64,
    per_worker: Vec<AtomicUsize>,
}

/// Sum `start..end`, splitting in halves until a range fits in one chunk.
fn sum_range(ctx: &JobContext<'_>, shared: Arc<Shared>, start: u64, end: u64) {
    if end - start <= shared.chunk {
        let sum: u64 = (start..end).sum();
        shared.total.fetch_add(sum, Ordering::Relaxed);
        shared.per_worker[ctx.worker_index()].fetch_add(1, Ordering::Relaxed);
        return;
    }
    let mid = start + (end - start) / 2;
    for (lo, hi) in [(start, mid), (mid, end)] {
        let shared = Arc::clone(&shared);
        if let Err(e) = ctx.spawn_child(move |child| sum_range(child, shared, lo, hi)) {
            log::error!("Failed to spawn range {}..{}: {}", lo, hi, e);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = JobSystemConfig::default()
        .with_max_worker_count(args.workers)
        .with_job_pool_capacity(args.pool_capacity);
    let system = JobSystem::new(config)?;

    let shared = Arc::new(Shared {
        total: AtomicU64::new(0),
        chunk: args.chunk.max(1),
        per_worker: (0..system.worker_count())
            .map(|_| AtomicUsize::new(0))
            .collect(),
    });

    let started = Instant::now();
    let root_shared = Arc::clone(&shared);
    let items = args.items;
    let root = system.spawn(move |ctx| sum_range(ctx, root_shared, 0, items))?;
    system.wait_for_job(root, true);
    let elapsed = started.elapsed();

    let expected = args.items.saturating_sub(1) * args.items / 2;
    let total = shared.total.load(Ordering::Relaxed);
    log::info!(
        "Sum of 0..{} = {} (expected {}) in {:?} on {} workers",
        args.items,
        total,
        expected,
        elapsed,
        system.worker_count()
    );
    for (index, count) in shared.per_worker.iter().enumerate() {
        log::info!("  worker {}: {} leaf jobs", index, count.load(Ordering::Relaxed));
    }
    system.shutdown();

    if total != expected {
        return Err(format!("sum mismatch: {total} != {expected}").into());
    }
    Ok(())
}
