//! `POST /api/v1/pm/:project_id/{start,pause,queue-next}`,
//! `GET /api/v1/pm/:project_id/status`.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use forge_orchestrator::PmStatus;

use crate::http::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<u32>,
}

impl From<PmStatus> for StatusResponse {
    fn from(status: PmStatus) -> Self {
        match status {
            PmStatus::NotRunning => Self { status: "not_running".into(), in_flight: None },
            PmStatus::Running { in_flight } => Self { status: "running".into(), in_flight: Some(in_flight) },
        }
    }
}

pub async fn start(State(state): State<AppState>, Path(project_id): Path<Uuid>) -> AppResult<Json<()>> {
    state.pm.start(project_id).await?;
    Ok(Json(()))
}

pub async fn pause(State(state): State<AppState>, Path(project_id): Path<Uuid>) -> AppResult<Json<()>> {
    state.pm.pause(project_id).await?;
    Ok(Json(()))
}

pub async fn queue_next(State(state): State<AppState>, Path(project_id): Path<Uuid>) -> AppResult<Json<()>> {
    state.pm.queue_next(project_id).await?;
    Ok(Json(()))
}

pub async fn status(State(state): State<AppState>, Path(project_id): Path<Uuid>) -> AppResult<Json<StatusResponse>> {
    let status = state.pm.status(project_id).await?;
    Ok(Json(status.into()))
}
