//! Reclaim Purge Queue Bench
//!
//! Pushes a synthetic mix of file purges, truncations and directory purges
//! through a purge queue backed by a simulated object store, waits for the
//! queue to drain and reports throughput and throttle behaviour.

mod backend;
mod workload;

use anyhow::{Result, bail};
use backend::SimulatedBackend;
use clap::Parser;
use reclaim_common::Config;
use reclaim_common::codec::{FEATURE_FILE_LAYOUT_V2, FEATURES_ALL};
use reclaim_queue::{FileJournal, MemJournalStore, PurgeJournal, PurgeQueue, StaticClusterView};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workload::{Workload, WorkloadMix};

#[derive(Parser, Debug)]
#[command(name = "reclaim-bench")]
#[command(about = "Drive a purge queue with a synthetic workload")]
#[command(version)]
struct Args {
    /// Configuration file path (defaults and RECLAIM__* overrides apply)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Journal file; the journal is kept in memory when unset
    #[arg(long)]
    journal: Option<PathBuf>,

    /// Compact the journal file once this many bytes have expired
    #[arg(long, default_value = "4194304")]
    journal_compact_bytes: u64,

    /// Encode items for peers without the v2 file layout encoding
    #[arg(long)]
    legacy_encoding: bool,

    /// Number of items to push
    #[arg(short = 'n', long, default_value = "1000")]
    items: u64,

    /// Fraction of items that purge a directory
    #[arg(long, default_value = "0.1")]
    dir_ratio: f64,

    /// Fraction of items that truncate a file
    #[arg(long, default_value = "0.1")]
    truncate_ratio: f64,

    /// Fraction of purged files with a backtrace in an older pool
    #[arg(long, default_value = "0.05")]
    migrated_ratio: f64,

    /// Largest generated file size in bytes
    #[arg(long, default_value = "268435456")]
    max_file_size: u64,

    /// Base latency of every backend operation
    #[arg(long, default_value = "2")]
    latency_ms: u64,

    /// Extra random latency, up to this much
    #[arg(long, default_value = "3")]
    jitter_ms: u64,

    /// Probability a backend operation fails
    #[arg(long, default_value = "0.0")]
    failure_rate: f64,

    /// Server rank owning the queue
    #[arg(long, default_value = "0")]
    rank: u32,

    /// Give up waiting for the queue to drain after this many seconds
    #[arg(long, default_value = "300")]
    timeout_secs: u64,

    /// Print the Prometheus metrics when done
    #[arg(long)]
    metrics: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!(
        "Purge queue limits: {} files, {} ops ({} per PG)",
        config.purge_queue.max_purge_files,
        config.purge_queue.max_purge_ops,
        config.purge_queue.max_purge_ops_per_pg
    );

    let journal: Arc<dyn PurgeJournal> = match &args.journal {
        Some(path) => {
            info!("Journal file: {}", path.display());
            Arc::new(FileJournal::with_compact_threshold(
                path,
                args.journal_compact_bytes,
            ))
        }
        None => Arc::new(MemJournalStore::new().journal()),
    };
    let backend = Arc::new(SimulatedBackend::new(
        Duration::from_millis(args.latency_ms),
        Duration::from_millis(args.jitter_ms),
        args.failure_rate,
    ));
    let cluster = Arc::new(StaticClusterView::from_config(&config.cluster));

    let mut queue = PurgeQueue::new(
        args.rank,
        config.cluster.metadata_pool,
        config.purge_queue.clone(),
        journal,
        backend.clone(),
        cluster,
    );
    if args.legacy_encoding {
        queue = queue.with_encode_features(FEATURES_ALL & !FEATURE_FILE_LAYOUT_V2);
    }
    let queue = Arc::new(queue);
    queue.init()?;
    queue.open().await?;
    info!("Op limit: {}", queue.max_purge_ops());

    let mut workload = Workload::new(
        WorkloadMix {
            dir_ratio: args.dir_ratio,
            truncate_ratio: args.truncate_ratio,
            max_file_size: args.max_file_size,
            migrated_ratio: args.migrated_ratio,
        },
        &config.cluster,
    );

    let start = Instant::now();
    let mut flushes = Vec::with_capacity(usize::try_from(args.items).unwrap_or_default());
    {
        let mut rng = rand::thread_rng();
        for _ in 0..args.items {
            flushes.push(queue.push(&workload.next_item(&mut rng))?);
        }
    }
    for flushed in flushes {
        flushed.await?;
    }
    let journaled = start.elapsed();
    info!("Journaled {} items in {:?}", args.items, journaled);

    let deadline = start + Duration::from_secs(args.timeout_secs);
    let mut last_report = Instant::now();
    let mut peak_items = 0;
    let mut peak_ops = 0;
    while !queue.is_idle() {
        if let Some(position) = queue.halted_at() {
            bail!("Purge queue halted at {position:#x}");
        }
        if Instant::now() > deadline {
            bail!("Purge queue did not drain within {}s", args.timeout_secs);
        }

        let stats = queue.stats();
        peak_items = peak_items.max(stats.executing);
        peak_ops = peak_ops.max(stats.executing_ops);
        if last_report.elapsed() >= Duration::from_secs(1) {
            info!(
                "Executed {}/{}, {} items / {} ops in flight",
                stats.executed, args.items, stats.executing, stats.executing_ops
            );
            last_report = Instant::now();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let elapsed = start.elapsed();
    let stats = queue.stats();
    queue.shutdown();

    let counters = &backend.counters;
    let failures = counters.failures.load(Ordering::Relaxed);
    if failures > 0 {
        warn!("{} backend operations failed", failures);
    }

    println!("items:            {}", args.items);
    println!("executed:         {}", stats.executed);
    println!("dropped:          {}", stats.item_dropped);
    println!("elapsed:          {elapsed:?} (journal {journaled:?})");
    println!(
        "throughput:       {:.1} items/s",
        stats.executed as f64 / elapsed.as_secs_f64()
    );
    println!("peak items:       {peak_items}");
    println!("peak ops:         {peak_ops} (limit {})", stats.max_purge_ops);
    println!(
        "backend:          {} range purges ({} objects), {} zeros, {} removes",
        counters.purge_ranges.load(Ordering::Relaxed),
        counters.objects_purged.load(Ordering::Relaxed),
        counters.zeros.load(Ordering::Relaxed),
        counters.removes.load(Ordering::Relaxed)
    );
    println!(
        "backend peak:     {} concurrent calls, {} failed",
        counters.peak_in_flight.load(Ordering::Relaxed),
        failures
    );

    if args.metrics {
        print!("{}", queue.render_metrics());
    }
    Ok(())
}
