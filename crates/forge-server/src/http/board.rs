//! `GET /api/v1/board/:project_id` — a point-in-time snapshot of a
//! project's kanban-style board. The live-push variant of this view is a
//! WebSocket layer consuming `BoardBus::subscribe`, out of scope here.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use forge_core::model::Task;

use crate::http::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct BoardSnapshot {
    pub columns: HashMap<String, Vec<Task>>,
    pub stats: HashMap<String, i64>,
    pub workers: HashMap<String, i64>,
}

pub async fn snapshot(State(state): State<AppState>, Path(project_id): Path<Uuid>) -> AppResult<Json<BoardSnapshot>> {
    let tasks = state.store.list_tasks(project_id).await?;

    let mut columns: HashMap<String, Vec<Task>> = HashMap::new();
    let mut stats: HashMap<String, i64> = HashMap::new();
    for task in tasks {
        let key = task.status.to_string();
        *stats.entry(key.clone()).or_insert(0) += 1;
        columns.entry(key).or_default().push(task);
    }

    let heartbeat_interval_secs = state.config.timeouts.heartbeat_interval_secs;
    let now = chrono::Utc::now();
    let mut workers: HashMap<String, i64> = HashMap::new();
    for worker in state.store.list_workers().await? {
        let key = worker.derived_status(now, heartbeat_interval_secs).to_string();
        *workers.entry(key).or_insert(0) += 1;
    }

    Ok(Json(BoardSnapshot { columns, stats, workers }))
}
