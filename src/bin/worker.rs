//! Conduit Worker - queue consumer and result router
//!
//! The worker consumes messages from a Redis stream, runs them through the
//! configured transform pipeline and delivers the result to the device's
//! live connection, if any.
//!
//! ## Configuration
//!
//! - `--config` / `CONDUIT_CONFIG`: TOML config path (default: `config/conduit.toml`)
//! - `--threads`: override `[worker] threads`; more than one runs a worker group
//! - `-v` / `-vv`: debug / trace logging, unless `RUST_LOG` is set
//!
//! A `.env` file in the working directory is loaded first, so `${VAR}`
//! placeholders in the config can come from it.

use clap::{ArgAction, Parser};
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use conduit::config::{ConduitConfig, DEFAULT_CONFIG_PATH};
use conduit::directory::RedisDirectory;
use conduit::dlq::RedisDeadLetters;
use conduit::hooks::{Hooks, WorkerStats};
use conduit::queue::RedisQueue;
use conduit::router::Router;
use conduit::shutdown::ShutdownSignal;
use conduit::transport::RedisTransport;
use conduit::worker::{Runnable, Worker, WorkerContext, WorkerRole};
use conduit::WorkerGroup;

/// Connections kept beyond one per worker, for acks and directory lookups
const SPARE_CONNECTIONS: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "conduit-worker", version, about = "Consume queued messages and route results to connected devices")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "CONDUIT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Number of worker threads (overrides the config file)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// Install the fmt subscriber; `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,conduit={level},conduit_worker={level}"))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Get the worker name from configuration or generate one.
fn worker_name(config: &ConduitConfig) -> String {
    if let Some(name) = &config.worker.name {
        return name.clone();
    }

    // Try hostname
    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("worker-{}", name);
        }
    }

    // Fallback to UUID
    format!("worker-{}", uuid::Uuid::new_v4())
}

fn create_pool(url: &str, size: usize) -> Result<Pool, deadpool_redis::CreatePoolError> {
    let mut cfg = Config::from_url(url);
    cfg.pool = Some(PoolConfig::new(size));
    cfg.create_pool(Some(Runtime::Tokio1))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = ConduitConfig::load_from(&args.config)?;
    if let Some(threads) = args.threads {
        config.worker.threads = threads;
        config.validate()?;
    }

    let worker_name = worker_name(&config);
    let threads = config.worker.threads;

    info!(
        worker_name = %worker_name,
        queue = %config.queue.name,
        consumer_group = %config.queue.consumer_group,
        threads = threads,
        "Conduit Worker starting"
    );

    // Unknown steps are fatal here, before anything is consumed
    let pipeline = config.build_pipeline()?;

    let pool_size = threads + SPARE_CONNECTIONS;
    let queue_pool = create_pool(&config.queue.url, pool_size)?;
    let directory_pool = if config.directory.url == config.queue.url {
        queue_pool.clone()
    } else {
        create_pool(&config.directory.url, pool_size)?
    };

    let queue = RedisQueue::connect(
        queue_pool.clone(),
        &config.queue.name,
        &config.queue.consumer_group,
        &worker_name,
    )
    .await?;

    let mut directory =
        RedisDirectory::new(directory_pool.clone()).with_key_prefix(&config.directory.key_prefix);
    if let Some(ttl) = config.directory.ttl_secs {
        directory = directory.with_ttl(Duration::from_secs(ttl));
    }
    let router = Router::new(
        Arc::new(directory),
        Arc::new(RedisTransport::new(directory_pool)),
    );

    let stats = Arc::new(WorkerStats::new());
    let hooks = Arc::new(Hooks::new().with(stats.clone()));

    let mut ctx = WorkerContext::new(Arc::new(queue), Arc::new(pipeline), Arc::new(router))
        .with_hooks(hooks.clone())
        .with_settings(config.poll_settings());
    if let Some(max_receives) = config.queue.max_receives {
        let dead_letters = RedisDeadLetters::for_queue(queue_pool, &config.queue.name);
        info!(
            max_receives = max_receives,
            stream = %dead_letters.stream(),
            "Dead letters enabled"
        );
        ctx = ctx.with_dead_letters(Arc::new(dead_letters));
    }

    hooks.process_ready();

    let runner: Box<dyn Runnable> = if threads > 1 {
        Box::new(WorkerGroup::new(ctx, threads, &worker_name))
    } else {
        Box::new(Worker::new(0, &worker_name, WorkerRole::Standalone, ctx))
    };
    runner.ready();

    // Setup graceful shutdown
    let shutdown = ShutdownSignal::new();
    let listener = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = listener.listen_for_signals().await {
            error!(error = %e, "Failed to install signal handlers");
        }
    });

    let exit = runner.run(&shutdown).await;

    info!(
        exit = ?exit,
        messages_processed = stats.processed(),
        messages_delivered = stats.delivered(),
        messages_failed = stats.failed(),
        "Worker shutdown complete"
    );
    Ok(())
}
