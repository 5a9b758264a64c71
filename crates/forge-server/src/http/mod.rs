//! The `/api/v1` HTTP surface — the sole authoritative route prefix.

pub mod admin;
pub mod board;
pub mod error;
pub mod pm;
pub mod tasks;
pub mod workers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/workers/register", post(workers::register))
        .route("/api/v1/workers/:id/heartbeat", post(workers::heartbeat))
        .route("/api/v1/tasks/:id/transition", post(tasks::transition))
        .route("/api/v1/pm/:project_id/start", post(pm::start))
        .route("/api/v1/pm/:project_id/pause", post(pm::pause))
        .route("/api/v1/pm/:project_id/queue-next", post(pm::queue_next))
        .route("/api/v1/pm/:project_id/status", get(pm::status))
        .route("/api/v1/board/:project_id", get(board::snapshot))
        .route("/api/v1/admin/tokens", post(admin::create_token))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
