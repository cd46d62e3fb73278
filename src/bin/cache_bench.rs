//! Workload driver for the pipelined cache.
//!
//! Runs one task per partition against in-memory storage, collecting and
//! persisting checkpoints as it goes, and prints throughput and counters.

use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pipelined_cache::cache::memory::{MemoryCheckpoint, MemoryStore};
use pipelined_cache::cache::{CacheOptions, CounterMetrics, PipelinedCache, Table};
use pipelined_cache::{PartitionId, Result};

type Store = MemoryStore<u64, u64>;
type Counters = Table<u64, u64, MemoryCheckpoint, Store>;

#[derive(Parser, Debug)]
#[command(
    name = "cache-bench",
    version,
    about = "Drive a read-modify-write workload through the pipelined cache"
)]
struct Args {
    #[arg(long, default_value_t = 4, help = "Number of partitions")]
    partitions: u32,

    #[arg(long, default_value_t = 10_000, help = "Transactions per partition")]
    transactions: usize,

    #[arg(long, default_value_t = 1_000, help = "Distinct keys per partition")]
    keys: u64,

    #[arg(long, default_value_t = 0, help = "Artificial load latency in microseconds")]
    load_latency_us: u64,

    #[arg(long, default_value_t = 500, help = "Commits between checkpoints")]
    checkpoint_every: usize,

    #[arg(long, default_value_t = 5, help = "Percentage of hits that delete the row")]
    delete_pct: u32,

    #[arg(long, default_value_t = 42, help = "Base RNG seed")]
    seed: u64,

    #[arg(
        long,
        value_name = "FILE",
        env = "CACHE_BENCH_CONFIG",
        help = "TOML file with cache options"
    )]
    config: Option<PathBuf>,
}

struct BenchResult {
    name: &'static str,
    partitions: u32,
    txs: usize,
    time: Duration,
}

impl BenchResult {
    fn print_header(section: &str) {
        println!("\n{}", section.to_uppercase());
        println!(
            "{:<20} {:>10} {:>10} {:>15} {:>15}",
            "BENCHMARK", "PARTS", "TXS", "TIME", "TX/S"
        );
    }

    fn print(&self) {
        let secs = self.time.as_secs_f64();
        let rate = if secs > 0.0 {
            self.txs as f64 / secs
        } else {
            0.0
        };
        println!(
            "{:<20} {:>10} {:>10} {:>15} {:>15.0}",
            self.name,
            self.partitions,
            self.txs,
            format_duration(self.time),
            rate
        );
    }
}

fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1_000 {
        format!("{} µs", micros)
    } else if micros < 1_000_000 {
        format!("{:.2} ms", micros as f64 / 1_000.0)
    } else {
        format!("{:.2} s", micros as f64 / 1_000_000.0)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

struct Workload {
    transactions: usize,
    keys: u64,
    checkpoint_every: usize,
    delete_pct: u32,
}

async fn run_partition(
    cache: Arc<PipelinedCache<MemoryCheckpoint>>,
    table: Arc<Counters>,
    partition: PartitionId,
    workload: Arc<Workload>,
    seed: u64,
) -> Result<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut checkpoints = 0;
    for done in 1..=workload.transactions {
        let key = rng.gen_range(0..workload.keys);
        let delete = rng.gen_range(0..100) < workload.delete_pct;

        let mut tx = cache.start_transaction(partition).await?;
        table.prefetch(&mut tx, key)?;
        if let Err(err) = tx.complete_prefetches().await {
            tx.abort()?;
            return Err(err);
        }
        let outcome = match table.try_get(&mut tx, &key)? {
            Some(_) if delete => table.delete(&mut tx, &key),
            Some(count) => table.update(&mut tx, &key, count + 1),
            None => table.create_non_existing(&mut tx, key, 1),
        };
        match outcome {
            Ok(()) => tx.commit()?,
            Err(err) => {
                tx.abort()?;
                return Err(err);
            }
        }

        if done % workload.checkpoint_every == 0 {
            checkpoint(&cache, partition).await?;
            checkpoints += 1;
        }
    }
    checkpoint(&cache, partition).await?;
    Ok(checkpoints + 1)
}

async fn checkpoint(cache: &PipelinedCache<MemoryCheckpoint>, partition: PartitionId) -> Result<()> {
    let mut command = MemoryCheckpoint::new();
    cache.collect_next_checkpoint(partition, &mut command).await?;
    command.persist()?;
    Ok(())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn Error>> {
    init_tracing();
    let args = Args::parse();

    let options = match args.config.as_ref() {
        Some(path) => CacheOptions::load(path)?,
        None => CacheOptions::default(),
    };
    if args.partitions as usize > options.dedup_vector_len {
        return Err(format!(
            "--partitions {} exceeds dedup_vector_len {}",
            args.partitions, options.dedup_vector_len
        )
        .into());
    }
    let counters = CounterMetrics::shared();
    let cache = Arc::new(PipelinedCache::new(options)?.with_metrics(counters.clone()));

    let mut store = MemoryStore::new("counters");
    if args.load_latency_us > 0 {
        store = store.with_load_latency(Duration::from_micros(args.load_latency_us));
    }
    let store = Arc::new(store);
    let table: Arc<Counters> = cache.create_table("counters", Arc::clone(&store))?;
    for id in 0..args.partitions {
        cache.recover_new_partition(PartitionId(id))?;
    }

    let workload = Arc::new(Workload {
        transactions: args.transactions,
        keys: args.keys.max(1),
        checkpoint_every: args.checkpoint_every.max(1),
        delete_pct: args.delete_pct.min(100),
    });
    info!(
        partitions = args.partitions,
        transactions = args.transactions,
        keys = workload.keys,
        "starting workload"
    );

    let start = Instant::now();
    let mut tasks = Vec::new();
    for id in 0..args.partitions {
        tasks.push(tokio::spawn(run_partition(
            Arc::clone(&cache),
            Arc::clone(&table),
            PartitionId(id),
            Arc::clone(&workload),
            args.seed.wrapping_add(u64::from(id)),
        )));
    }
    let mut checkpoints = 0;
    for task in tasks {
        checkpoints += task.await??;
    }
    let elapsed = start.elapsed();

    BenchResult::print_header("pipelined cache");
    BenchResult {
        name: "read-modify-write",
        partitions: args.partitions,
        txs: args.transactions * args.partitions as usize,
        time: elapsed,
    }
    .print();

    println!("\nCOUNTERS");
    println!("{:<20} {:>15}", "commits", counters.commits.load(Ordering::Relaxed));
    println!("{:<20} {:>15}", "aborts", counters.aborts.load(Ordering::Relaxed));
    println!("{:<20} {:>15.3}", "prefetch hit rate", counters.prefetch_hit_rate());
    println!("{:<20} {:>15}", "loads", store.loads());
    println!(
        "{:<20} {:>15}",
        "lock contentions",
        counters.lock_contentions.load(Ordering::Relaxed)
    );
    println!("{:<20} {:>15}", "checkpoints", checkpoints);
    println!(
        "{:<20} {:>15}",
        "checkpoint deltas",
        counters.checkpoint_deltas.load(Ordering::Relaxed)
    );
    println!("{:<20} {:>15}", "durable rows", store.len());
    Ok(())
}
