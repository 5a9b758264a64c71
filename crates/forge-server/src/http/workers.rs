//! `POST /api/v1/workers/register`, `POST /api/v1/workers/:id/heartbeat`.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use forge_orchestrator::{HeartbeatDirective, HeartbeatOutcome};

use crate::http::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub token: String,
    pub display_name: String,
    pub platform: String,
    pub executor: String,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub worker_id: Uuid,
    pub worker_secret: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<Json<RegisterResponse>> {
    let (worker_id, worker_secret) = state
        .registry
        .register(&req.token, req.display_name, req.platform, req.executor, req.capabilities)
        .await?;
    Ok(Json(RegisterResponse { worker_id, worker_secret }))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_secret: String,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub pending_tasks: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<Uuid>,
    pub directive: String,
}

impl From<HeartbeatOutcome> for HeartbeatResponse {
    fn from(outcome: HeartbeatOutcome) -> Self {
        Self {
            status: outcome.status.to_string(),
            pending_tasks: outcome.pending_tasks,
            current_task_id: outcome.current_task_id,
            directive: match outcome.directive {
                HeartbeatDirective::Continue => "continue".into(),
                HeartbeatDirective::Drain => "drain".into(),
            },
        }
    }
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    Json(req): Json<HeartbeatRequest>,
) -> AppResult<Json<HeartbeatResponse>> {
    let outcome = state.registry.heartbeat(worker_id, &req.worker_secret).await?;
    Ok(Json(outcome.into()))
}
