//! Command-line and environment configuration.
//!
//! ```bash
//! TRANSQ_REDIS_URL=redis://cache:6379 PORT=8080 transq api
//! transq worker --concurrency 4 --consumer-id worker-a
//! transq standalone --log-level debug
//! ```

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use transq_core::app::WorkerOptions;
use transq_core::transport::ReconnectPolicy;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "transq")]
#[command(about = "Asynchronous translation queue: HTTP submission, durable queue, workers")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the HTTP API (submission and status).
    Api(ApiArgs),

    /// Consume the queue and run translations.
    Worker(WorkerArgs),

    /// API and workers in one process over in-memory backends.
    Standalone {
        #[command(flatten)]
        api: ApiArgs,

        #[command(flatten)]
        worker: WorkerArgs,
    },
}

#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Redis URL used for both the queue and the task record store
    #[arg(long, global = true, default_value = "redis://127.0.0.1:6379", env = "TRANSQ_REDIS_URL")]
    pub redis_url: String,

    /// Name of the durable task queue
    #[arg(long, global = true, default_value = "translations", env = "TRANSQ_QUEUE")]
    pub queue: String,

    /// Prefix for every Redis key
    #[arg(long, global = true, default_value = "transq", env = "TRANSQ_KEY_PREFIX")]
    pub key_prefix: String,

    /// Startup connection attempts before giving up
    #[arg(long, global = true, default_value = "10", env = "TRANSQ_CONNECT_ATTEMPTS")]
    pub connect_attempts: u32,

    /// Delay between connection attempts, in milliseconds
    #[arg(long, global = true, default_value = "3000", env = "TRANSQ_RETRY_DELAY_MS")]
    pub retry_delay_ms: u64,

    /// tracing filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info", env = "TRANSQ_LOG")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "TRANSQ_LOG_JSON")]
    pub log_json: bool,
}

impl CommonArgs {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.connect_attempts, Duration::from_millis(self.retry_delay_ms))
    }
}

#[derive(Debug, Clone, Args)]
pub struct ApiArgs {
    #[arg(long, default_value = "0.0.0.0", env = "TRANSQ_BIND")]
    pub bind: IpAddr,

    #[arg(short, long, default_value = "3000", env = "PORT")]
    pub port: u16,
}

impl ApiArgs {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    /// Number of sequential consume loops in this process
    #[arg(long, default_value = "1", env = "TRANSQ_CONCURRENCY")]
    pub concurrency: usize,

    /// Deadline for a single translation, in milliseconds
    #[arg(long, default_value = "30000", env = "TRANSQ_TASK_TIMEOUT_MS")]
    pub task_timeout_ms: u64,

    /// Name of this worker's processing list. A stable name recovers it on
    /// restart; otherwise it is reclaimed once its liveness key expires.
    #[arg(long, env = "TRANSQ_CONSUMER_ID")]
    pub consumer_id: Option<String>,
}

impl WorkerArgs {
    pub fn options(&self) -> WorkerOptions {
        WorkerOptions {
            task_timeout: Duration::from_millis(self.task_timeout_ms),
            ..WorkerOptions::default()
        }
    }

    pub fn consumer_id(&self) -> String {
        self.consumer_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Ulid::new()))
    }
}
