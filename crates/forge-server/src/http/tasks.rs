//! `POST /api/v1/tasks/:id/transition`.
//!
//! Doesn't chase `waiting -> ready` promotion of the task's dependents
//! itself — that's left to the PM loop's periodic `reevaluate_waiting`
//! tick, so this handler stays a single propose/commit round trip.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use forge_core::board::BoardEvent;
use forge_core::machine::{self, DepStatus};
use forge_core::model::{Actor, TaskState};
use forge_core::store::CasOutcome;

use crate::http::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub new_status: TaskState,
    pub actor: Actor,
    pub expected_version: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub task_id: Uuid,
    pub status: TaskState,
    pub previous_status: TaskState,
    pub version: i64,
}

pub async fn transition(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<TransitionRequest>,
) -> AppResult<Json<TransitionResponse>> {
    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or(forge_core::error::ForgeError::NotFound { kind: "task", id: task_id })?;
    let previous_status = task.status;

    let dep_statuses: Vec<DepStatus> = state
        .store
        .get_dependency_statuses(task_id)
        .await?
        .into_iter()
        .map(|(task_id, status)| DepStatus { task_id, status })
        .collect();

    let mutation = machine::propose_transition(
        &task,
        req.new_status,
        req.actor,
        req.reason,
        req.expected_version,
        &dep_statuses,
    )?;

    match state
        .store
        .compare_and_set_task(&mutation.task, &mutation.record, req.expected_version)
        .await?
    {
        CasOutcome::Applied => {}
        CasOutcome::VersionMismatch { current } => {
            return Err(AppError::from(forge_core::error::ForgeError::VersionConflict {
                task_id,
                expected: req.expected_version,
                current,
            }));
        }
        CasOutcome::NotFound => {
            return Err(AppError::from(forge_core::error::ForgeError::NotFound { kind: "task", id: task_id }));
        }
    }

    state.board.publish(
        mutation.task.project_id,
        BoardEvent::TaskMoved {
            task_id,
            from: previous_status.to_string(),
            to: mutation.task.status.to_string(),
            ts: chrono::Utc::now(),
        },
    );

    Ok(Json(TransitionResponse {
        task_id,
        status: mutation.task.status,
        previous_status,
        version: mutation.task.version,
    }))
}
