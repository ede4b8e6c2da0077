//! transq: entry point.
//!
//! Startup order:
//! 1. Parse configuration from flags and environment variables.
//! 2. Initialise structured tracing.
//! 3. Connect the task record store and the queue transport (fatal on failure).
//! 4. Run the HTTP API, the worker group, or both, until SIGINT/SIGTERM.

mod config;
mod http;
mod state;

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use transq_core::app::{SubmissionService, WorkerGroup, WorkerLoop};
use transq_core::impls::{InMemoryBroker, InMemoryTaskStore, ReverseTransformer};
use transq_core::ports::{Broker, SystemClock, TaskStore, UlidGenerator};
use transq_core::transport::ConnectionManager;
use transq_redis::{RedisBroker, RedisTaskStore};

use crate::config::{ApiArgs, Cli, Command, CommonArgs, WorkerArgs};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.common);
    info!(version = env!("CARGO_PKG_VERSION"), "transq starting");

    match cli.command {
        Command::Api(api) => {
            let store = redis_store(&cli.common).await?;
            let broker = redis_publisher(&cli.common)?;
            let transport = connect(&cli.common, broker).await?;
            run_api(api, store, Arc::clone(&transport)).await?;
            transport.shutdown();
        }
        Command::Worker(worker) => {
            let store = redis_store(&cli.common).await?;
            let consumer_id = worker.consumer_id();
            info!(%consumer_id, "worker consumer");
            let broker = redis_broker(&cli.common, &consumer_id)?;
            let transport = connect(&cli.common, broker).await?;
            let group = spawn_workers(&worker, store, Arc::clone(&transport));
            shutdown_signal().await;
            group.shutdown_and_join().await;
            transport.shutdown();
        }
        Command::Standalone { api, worker } => {
            warn!("standalone mode keeps tasks in memory; they are lost on exit");
            let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
            let transport = connect(&cli.common, Arc::new(InMemoryBroker::new())).await?;
            let group = spawn_workers(&worker, Arc::clone(&store), Arc::clone(&transport));
            run_api(api, store, Arc::clone(&transport)).await?;
            group.shutdown_and_join().await;
            transport.shutdown();
        }
    }

    info!("transq stopped");
    Ok(())
}

fn init_tracing(common: &CommonArgs) {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match common.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: TRANSQ_LOG='{}' is not a valid tracing filter ({}); falling back to 'info'",
                    common.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if common.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn redis_store(common: &CommonArgs) -> anyhow::Result<Arc<dyn TaskStore>> {
    let store = RedisTaskStore::new(&common.redis_url)
        .await?
        .with_prefix(common.key_prefix.clone());
    info!(redis_url = %common.redis_url, "task record store ready");
    Ok(Arc::new(store))
}

/// API processes only publish, so they register no consumer.
fn redis_publisher(common: &CommonArgs) -> anyhow::Result<Arc<dyn Broker>> {
    let broker = RedisBroker::publisher(&common.redis_url)?.with_prefix(common.key_prefix.clone());
    Ok(Arc::new(broker))
}

fn redis_broker(common: &CommonArgs, consumer_id: &str) -> anyhow::Result<Arc<dyn Broker>> {
    let broker = RedisBroker::new(&common.redis_url, consumer_id)?.with_prefix(common.key_prefix.clone());
    Ok(Arc::new(broker))
}

/// `ConnectionExhausted` here ends the process with a non-zero status.
async fn connect(common: &CommonArgs, broker: Arc<dyn Broker>) -> anyhow::Result<Arc<ConnectionManager>> {
    let transport = ConnectionManager::connect(broker, common.queue.clone(), common.reconnect_policy()).await?;
    Ok(transport)
}

async fn run_api(
    api: ApiArgs,
    store: Arc<dyn TaskStore>,
    transport: Arc<ConnectionManager>,
) -> anyhow::Result<()> {
    let submission = Arc::new(SubmissionService::new(
        store,
        Arc::clone(&transport),
        Arc::new(UlidGenerator::new(SystemClock)),
        Arc::new(SystemClock),
    ));
    let state = Arc::new(AppState {
        submission,
        transport,
    });
    http::serve(api.addr(), state, shutdown_signal()).await
}

fn spawn_workers(
    worker: &WorkerArgs,
    store: Arc<dyn TaskStore>,
    transport: Arc<ConnectionManager>,
) -> WorkerGroup {
    let worker_loop = WorkerLoop::new(
        transport,
        store,
        Arc::new(ReverseTransformer),
        Arc::new(SystemClock),
        worker.options(),
    );
    let concurrency = worker.concurrency.max(1);
    info!(concurrency, "starting workers");
    WorkerGroup::spawn(concurrency, Arc::new(worker_loop))
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
