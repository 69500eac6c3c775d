//! Rollup Store daemon
//!
//! Runs the tiered store with its watchdog and an ingest worker. Ingest
//! messages are read as JSON lines from stdin:
//!
//! ```bash
//! echo '{"entityId":"web-1","timestamp":1278000000000,"metrics":{"hits":{"value":1,"type":"AGGREGATE"}}}' \
//!   | rollupd --config rollup.toml run
//! ```
//!
//! # CLI Commands
//!
//! - `run` - Build the store from config and process ingest until Ctrl-C/SIGTERM
//! - `check-config` - Validate configuration and print a summary
//! - `plan` - Print the read plan for a date range as JSON
//!
//! # Configuration
//!
//! The daemon reads configuration from:
//! 1. `--config` (path to TOML file)
//! 2. `ROLLUP_CONFIG` environment variable
//! 3. Defaults
//!
//! `ROLLUP_*` environment variables override individual values.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rollup_store::config::Config;
use rollup_store::ingestion::{Delivery, IngestWorker, Outcome};
use rollup_store::lock::{Lock, LocalLock, LockKind, SharedLock};
use rollup_store::query::{query_count, QueryOptimizer};
use rollup_store::redis::{util::sanitize_url, RedisBucketStore, RedisPool, RedisSharedCache};
use rollup_store::services::{ServiceManager, WatchDog};
use rollup_store::storage::{BucketStore, BufferedStore, DataStore, MemoryBucketStore, TieredStore};
use rollup_store::types::{format_timestamp, parse_timestamp};
use rollup_store::{logging, metrics, FastFailCheck};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "rollupd")]
#[command(version)]
#[command(about = "Tiered metrics rollup store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (overrides ROLLUP_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the store and ingest JSON lines from stdin
    Run,

    /// Validate configuration without starting anything
    CheckConfig,

    /// Show which buckets a read over a range would touch
    Plan {
        /// Range start (epoch millis or RFC 3339)
        #[arg(long)]
        start: String,

        /// Range end (epoch millis or RFC 3339)
        #[arg(long)]
        end: String,
    },
}

fn load_config(cli: &Cli) -> Result<Config, BoxError> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("ROLLUP_CONFIG").map(PathBuf::from));

    let config = match path {
        Some(path) => Config::load(path)?,
        None => {
            let config = Config::from_env()?;
            config.validate()?;
            config
        },
    };
    Ok(config)
}

// =============================================================================
// CLI Command Handlers
// =============================================================================

/// Validate configuration and print summary
fn cmd_check_config(config: &Config) {
    println!("Configuration is valid!");
    println!();
    println!("Store Settings:");
    let tiers: Vec<&str> = config
        .store
        .supported_periods
        .iter()
        .map(|p| p.as_str())
        .collect();
    println!("  Supported periods: {}", tiers.join(", "));
    println!("  Lock retries: {}", config.store.max_lock_retries);
    println!("  Lock kind: {:?}", config.lock.kind);
    println!();
    println!("Write Buffer:");
    println!("  Enabled: {}", config.buffer.enabled);
    if config.buffer.enabled {
        println!("  Granularity: {} ms", config.buffer.granularity_ms);
    }
    println!();
    println!("Redis Settings:");
    println!("  Enabled: {}", config.redis.enabled);
    if config.redis.enabled {
        println!("  URL: {}", sanitize_url(&config.redis.url));
        println!("  Pool size: {}", config.redis.pool_size);
    }
    println!();
    println!("Log level: {}", config.logging.level);
}

/// Print the read plan for a range as JSON
fn cmd_plan(config: &Config, start: &str, end: &str) -> Result<(), BoxError> {
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;
    let optimizer = QueryOptimizer::new(&config.store.supported_periods)?;
    let plan = optimizer.optimal_slices(start, end)?;

    let reads: Vec<serde_json::Value> = plan
        .iter()
        .flat_map(|(period, ranges)| {
            ranges.iter().map(move |range| {
                serde_json::json!({
                    "period": period.as_str(),
                    "start": format_timestamp(range.start),
                    "end": format_timestamp(range.end),
                    "buckets": range.to_dates(*period).len(),
                })
            })
        })
        .collect();

    let output = serde_json::json!({
        "start": format_timestamp(start),
        "end": format_timestamp(end),
        "queries": query_count(&plan),
        "reads": reads,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// =============================================================================
// Run
// =============================================================================

struct Stack {
    store: Arc<dyn DataStore>,
    buffer: Option<Arc<BufferedStore>>,
    fail_check: Arc<FastFailCheck>,
}

async fn build_stack(config: &Config) -> Result<Stack, BoxError> {
    let fail_check = Arc::new(FastFailCheck::new(config.fail_fast.clone()));

    let pool = if config.redis.enabled {
        let pool = Arc::new(RedisPool::new(config.redis.clone()).await?);
        info!(url = %sanitize_url(&config.redis.url), "Connected to Redis");
        Some(pool)
    } else {
        None
    };

    let backend: Arc<dyn BucketStore> = match &pool {
        Some(pool) => Arc::new(RedisBucketStore::new(Arc::clone(pool))),
        None => {
            warn!("Redis disabled, buckets are kept in memory and lost on exit");
            Arc::new(MemoryBucketStore::new())
        },
    };

    let lock: Arc<dyn Lock> = match (config.lock.kind, &pool) {
        (LockKind::Shared, Some(pool)) => Arc::new(SharedLock::new(
            RedisSharedCache::new(Arc::clone(pool)),
            &config.lock,
        )),
        (LockKind::Shared, None) => {
            return Err("shared lock requires redis.enabled".into());
        },
        (LockKind::Local, _) => Arc::new(LocalLock::from_config(&config.lock)),
    };

    let tiered: Arc<dyn DataStore> = Arc::new(TieredStore::new(
        backend,
        lock,
        Arc::clone(&fail_check),
        &config.store,
    )?);

    let (store, buffer) = if config.buffer.enabled {
        let buffer = Arc::new(BufferedStore::new(tiered, &config.buffer));
        let store: Arc<dyn DataStore> = buffer.clone();
        (store, Some(buffer))
    } else {
        (tiered, None)
    };

    Ok(Stack {
        store,
        buffer,
        fail_check,
    })
}

/// Feed stdin lines into the ingest channel
///
/// A redelivered line is retried after `retry_delay` until it is acked or
/// rejected.
async fn feed_stdin(sender: mpsc::Sender<Delivery>, retry_delay: Duration) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Stdin closed");
                return;
            },
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                return;
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        loop {
            let (delivery, outcome) = Delivery::new(line.clone());
            if sender.send(delivery).await.is_err() {
                return;
            }
            match outcome.await {
                Ok(Outcome::Acked) => break,
                Ok(Outcome::Rejected(reason)) => {
                    warn!(reason = %reason, "Message rejected");
                    break;
                },
                Ok(Outcome::Redeliver(reason)) => {
                    debug!(reason = %reason, "Message will be redelivered");
                    tokio::time::sleep(retry_delay).await;
                },
                Err(_) => return,
            }
        }
    }
}

async fn cmd_run(config: Config) -> Result<(), BoxError> {
    logging::init(&config.logging)?;
    info!("Starting rollupd v{}", env!("CARGO_PKG_VERSION"));
    debug!(
        tiers = ?config.store.supported_periods,
        lock = ?config.lock.kind,
        buffer = config.buffer.enabled,
        "Configuration loaded"
    );

    let stack = build_stack(&config).await?;

    let (sender, receiver) = mpsc::channel(config.ingest.channel_capacity);
    let worker = Arc::new(IngestWorker::new(
        Arc::clone(&stack.store),
        Arc::clone(&stack.fail_check),
        receiver,
    ));

    let watchdog = Arc::new(WatchDog::new(Arc::clone(&stack.fail_check), &config.watchdog));
    watchdog.register(worker.clone());
    if let Some(buffer) = &stack.buffer {
        watchdog.register(buffer.clone());
    }

    let manager = ServiceManager::with_defaults();
    manager.register(watchdog)?;
    manager.register(worker)?;
    manager.start_all().await?;

    let feeder = tokio::spawn(feed_stdin(
        sender,
        Duration::from_millis(config.watchdog.interval_ms),
    ));

    shutdown_signal().await;

    feeder.abort();
    manager.shutdown().await?;

    // Buffered slices would otherwise be lost
    if let Some(buffer) = &stack.buffer {
        flush_on_shutdown(buffer).await;
    }

    match metrics::gather_text() {
        Ok(text) => debug!(metrics = %text, "Final metrics"),
        Err(e) => warn!(error = %e, "Failed to render metrics"),
    }
    info!("Shutdown complete");
    Ok(())
}

async fn flush_on_shutdown(buffer: &BufferedStore) {
    let pending = buffer.pending_entities().await;
    if pending == 0 {
        return;
    }
    info!(entities = pending, "Flushing write buffer before shutdown");

    match buffer.flush().await {
        Ok(()) => info!("Write buffer flushed"),
        Err(e) => warn!(
            error = %e,
            "Failed to flush write buffer during shutdown - data may be lost"
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {},
            Err(e) => {
                warn!(
                    error = %e,
                    "Ctrl+C handler installation failed - graceful shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(
                    error = %e,
                    "SIGTERM handler installation failed - SIGTERM shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::CheckConfig => {
            cmd_check_config(&config);
            Ok(())
        },
        Commands::Plan { start, end } => cmd_plan(&config, start, end),
        Commands::Run => cmd_run(config).await,
    }
}
