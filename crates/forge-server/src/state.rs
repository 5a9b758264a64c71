//! Shared application state handed to every axum handler via `State`.

use std::sync::Arc;

use forge_core::board::BoardBus;
use forge_core::config::ForgeConfig;
use forge_orchestrator::{PmSupervisor, WorkerRegistry};
use forge_postgres::PgStore;
use forge_queue::RedisStreamQueue;

/// Concrete wiring of the backbone for the running service. Unlike
/// `forge-orchestrator`'s types, which stay generic over `Store`/`StreamQueue`
/// for unit-testability, this fixes the real Postgres/Redis adapters — axum's
/// `State` extractor needs one concrete `Clone + Send + Sync + 'static` type.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PgStore>,
    pub queue: Arc<RedisStreamQueue>,
    pub registry: Arc<WorkerRegistry<PgStore>>,
    pub pm: Arc<PmSupervisor<PgStore, RedisStreamQueue>>,
    pub board: BoardBus,
    pub config: Arc<ForgeConfig>,
}
