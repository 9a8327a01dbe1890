//! rangecache CLI
//!
//! Operates on one cache file:
//!
//! ```text
//! rangecache fill   <source> <cache>         copy missing ranges from source
//! rangecache refill <cache> <offset> <size>  print the range still to fetch
//! rangecache evict  <cache> <offset> [--len] drop cached data
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rangecache::cache::{CacheStore, EvictSpan, LruPool};
use rangecache::config::Config;
use rangecache::file::{AsyncFile, LocalFile};
use rangecache::metrics::{IoStatsSnapshot, StoreStatsSnapshot};
use rangecache::throttle::ThrottledFile;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Rate-limited, range-locked local cache store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "RANGECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

/// Settings that override the configuration file.
#[derive(ClapArgs, Debug)]
struct Overrides {
    /// Combined operations per second
    #[arg(long, env = "RANGECACHE_IOPS")]
    iops: Option<u32>,

    /// Combined bytes per second
    #[arg(long, env = "RANGECACHE_THROUGHPUT")]
    throughput: Option<u32>,

    /// Writes in flight at once
    #[arg(long, env = "RANGECACHE_WRITE_CONCURRENCY")]
    write_concurrency: Option<u32>,

    /// Largest single write forwarded to disk
    #[arg(long, env = "RANGECACHE_WRITE_BLOCK_SIZE")]
    write_block_size: Option<usize>,

    /// Refill granularity in bytes (power of 2)
    #[arg(long, env = "RANGECACHE_REFILL_UNIT")]
    refill_unit: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy the parts of <source> missing from <cache>
    Fill {
        source: PathBuf,
        cache: PathBuf,
        /// Pool capacity in bytes (0 = unlimited)
        #[arg(long, default_value = "0")]
        capacity: u64,
    },
    /// Print the range of <cache> still to be fetched
    Refill { cache: PathBuf, offset: u64, size: u64 },
    /// Drop cached data from <offset>; the whole tail unless --len is given
    Evict {
        cache: PathBuf,
        offset: u64,
        #[arg(long)]
        len: Option<u64>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;

    match &args.command {
        Command::Fill {
            source,
            cache,
            capacity,
        } => {
            let report = fill(&config, source, cache, *capacity).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Refill {
            cache,
            offset,
            size,
        } => {
            let store = open_store(&config, cache, Arc::new(LruPool::new(0)))?;
            let range = store.query_refill_range(*offset, *size).await?;
            println!("{}", serde_json::to_string(&range)?);
        }
        Command::Evict { cache, offset, len } => {
            let store = open_store(&config, cache, Arc::new(LruPool::new(0)))?;
            let span = len.map(EvictSpan::Len).unwrap_or(EvictSpan::ToEnd);
            store.evict(*offset, span).await?;
            info!(offset, ?span, "evicted");
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };

    let o = &args.overrides;
    if let Some(iops) = o.iops {
        config.throttle.rw.iops = iops;
    }
    if let Some(throughput) = o.throughput {
        config.throttle.rw.throughput = throughput;
    }
    if let Some(n) = o.write_concurrency {
        config.throttle.write.concurrent_ops = n;
    }
    if let Some(n) = o.write_block_size {
        config.throttle.write.block_size = n;
    }
    if let Some(unit) = o.refill_unit {
        config.store.refill_unit = unit;
    }
    config.validate()?;
    Ok(config)
}

fn open_store(
    config: &Config,
    path: &Path,
    pool: Arc<LruPool>,
) -> Result<CacheStore<ThrottledFile<LocalFile>>> {
    let file = LocalFile::create(path).with_context(|| format!("opening cache {}", path.display()))?;
    let file = ThrottledFile::new(file, config.throttle);
    let entry = pool.open_entry(path.display().to_string());
    Ok(CacheStore::new(file, pool, entry, config.store.clone())?)
}

// =============================================================================
// Fill
// =============================================================================

#[derive(Debug, Serialize)]
struct FillReport {
    source_size: u64,
    fetched_bytes: u64,
    skipped_chunks: u64,
    pool_used: u64,
    io: IoStatsSnapshot,
    store: StoreStatsSnapshot,
}

async fn fill(config: &Config, source: &Path, cache: &Path, capacity: u64) -> Result<FillReport> {
    let origin = LocalFile::open_read_only(source)
        .with_context(|| format!("opening source {}", source.display()))?;
    let source_size = origin.fstat().await?.size;

    let pool = Arc::new(LruPool::new(capacity));
    let store = open_store(config, cache, pool.clone())?;
    let chunk = config.store.refill_unit;

    info!(
        source = %source.display(),
        cache = %cache.display(),
        size = source_size,
        chunk,
        "filling cache"
    );

    let mut fetched = 0u64;
    let mut skipped = 0u64;
    let mut buf = Vec::new();
    let mut offset = 0u64;
    while offset < source_size {
        let want = chunk.min(source_size - offset);
        let range = store.query_refill_range(offset, want).await?;
        offset += want;
        if range.is_cached() {
            skipped += 1;
            continue;
        }

        let end = range.end().min(source_size);
        if range.offset >= end {
            continue;
        }
        buf.resize((end - range.offset) as usize, 0);
        let n = origin.pread(&mut buf, range.offset).await?;
        let written = store
            .pwrite(&buf[..n], range.offset)
            .await
            .with_context(|| format!("writing cache at {}", range.offset))?;
        fetched += written as u64;
    }

    Ok(FillReport {
        source_size,
        fetched_bytes: fetched,
        skipped_chunks: skipped,
        pool_used: pool.used(),
        io: store.file().stats().snapshot(),
        store: store.stats().snapshot(),
    })
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Log output goes to stderr so JSON results on stdout stay parseable.
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
