//! `forge-server` — boots the durable store and stream queue adapters,
//! wires the Worker Registry / PM Supervisor / Result Ingester, and serves
//! the `/api/v1` HTTP surface. The binary edge: `anyhow` end to end, errors
//! from `forge-core`/adapters cross the `?` boundary via their `From` impls.

mod http;
mod state;
mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use forge_core::board::BoardBus;
use forge_core::config::ForgeConfig;
use forge_orchestrator::{PmSupervisor, ResultIngester, WorkerRegistry};
use forge_postgres::PgStore;
use forge_queue::RedisStreamQueue;

use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("FORGE_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("Forge.toml"));
    let config = ForgeConfig::load(&config_path)?;

    telemetry::init_telemetry(&config.telemetry)?;
    info!(bind = %config.bind_addr, "starting forge-server");

    let store = PgStore::connect(&config.database_url).await?;
    store.migrate().await?;
    let store = Arc::new(store);
    let queue = Arc::new(RedisStreamQueue::connect(&config.redis_url).await?);
    let board = BoardBus::new();
    let registry = Arc::new(WorkerRegistry::new(store.clone(), config.timeouts.heartbeat_interval_secs));
    let pm = Arc::new(PmSupervisor::new(
        store.clone(),
        queue.clone(),
        registry.clone(),
        board.clone(),
        config.scheduling,
    ));

    let cancel = CancellationToken::new();
    spawn_ingesters(store.clone(), queue.clone(), registry.clone(), board.clone(), cancel.clone());
    resume_active_projects(&store, &pm).await?;

    let state = AppState {
        store,
        queue,
        registry,
        pm,
        board,
        config: Arc::new(config.clone()),
    };

    let addr: SocketAddr = config.bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "forge-server listening");

    let router = http::router(state);
    let shutdown = shutdown_signal(cancel);
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

/// Start the Result Ingester's consume loop and its janitor as two
/// independent `tokio::task`s.
fn spawn_ingesters(
    store: Arc<PgStore>,
    queue: Arc<RedisStreamQueue>,
    registry: Arc<WorkerRegistry<PgStore>>,
    board: BoardBus,
    cancel: CancellationToken,
) {
    let ingester = Arc::new(ResultIngester::new(store, queue, registry, board, "forge-server"));

    let run_cancel = cancel.clone();
    let run_ingester = ingester.clone();
    tokio::spawn(async move {
        run_ingester.run(run_cancel, 1_000).await;
    });

    let janitor_ingester = ingester;
    tokio::spawn(async move {
        janitor_ingester.run_janitor(cancel).await;
    });
}

/// Projects left `active` across a server restart don't get a PM loop for
/// free — `PmSupervisor`'s map starts empty. Re-`start` each one so the
/// supervised loop resumes without an operator having to notice and
/// re-issue `pm/start` by hand.
async fn resume_active_projects(
    store: &Arc<PgStore>,
    pm: &Arc<PmSupervisor<PgStore, RedisStreamQueue>>,
) -> anyhow::Result<()> {
    use forge_core::model::ProjectStatus;
    use forge_core::store::Store;

    for project in store.list_projects_by_status(ProjectStatus::Active).await? {
        info!(project_id = %project.id, "resuming PM loop for active project");
        if let Err(err) = pm.start(project.id).await {
            tracing::warn!(project_id = %project.id, error = %err, "failed to resume PM loop");
        }
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
    cancel.cancel();
}
