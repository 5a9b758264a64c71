//! The `{error: {kind, message, task_id?, expected_version?,
//! current_version?}}` envelope (spec §6 "External interfaces"), built once
//! from `ForgeError` and shared by every handler via `AppError`'s `From`
//! conversion and `?`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use forge_core::error::ForgeError;
use serde_json::json;

pub struct AppError(ForgeError);

impl From<ForgeError> for AppError {
    fn from(err: ForgeError) -> Self {
        AppError(err)
    }
}

/// Build the `error` object's optional fields for one `ForgeError`: `task_id`
/// when the error names a task, plus `expected_version`/`current_version`
/// when it's a `VersionConflict` (spec §6's `{kind, message, task_id?,
/// expected_version?, current_version?}`).
fn error_body(err: &ForgeError) -> serde_json::Value {
    let (task_id, expected_version, current_version) = match err {
        ForgeError::VersionConflict { task_id, expected, current } => {
            (Some(*task_id), Some(*expected), Some(*current))
        }
        ForgeError::IllegalTransition { task_id, .. } => (Some(*task_id), None, None),
        ForgeError::DependencyNotSatisfied { task_id, .. } => (Some(*task_id), None, None),
        ForgeError::MissingPrerequisite { task_id, .. } => (Some(*task_id), None, None),
        ForgeError::LostUpdate { task_id, .. } => (Some(*task_id), None, None),
        ForgeError::NoEligibleWorker { task_id } => (Some(*task_id), None, None),
        ForgeError::NotFound { kind: "task", id } => (Some(*id), None, None),
        _ => (None, None, None),
    };

    let mut body = json!({
        "kind": err.kind(),
        "message": err.to_string(),
    });
    let obj = body.as_object_mut().expect("error envelope is always an object");
    if let Some(task_id) = task_id {
        obj.insert("task_id".into(), json!(task_id));
    }
    if let Some(expected_version) = expected_version {
        obj.insert("expected_version".into(), json!(expected_version));
    }
    if let Some(current_version) = current_version {
        obj.insert("current_version".into(), json!(current_version));
    }
    body
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = error_body(&self.0);
        (status, Json(json!({ "error": body }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn version_conflict_envelope_carries_versions() {
        let task_id = Uuid::new_v4();
        let body = error_body(&ForgeError::VersionConflict {
            task_id,
            expected: 5,
            current: 6,
        });
        assert_eq!(body["kind"], "version_conflict");
        assert_eq!(body["task_id"], task_id.to_string());
        assert_eq!(body["expected_version"], 5);
        assert_eq!(body["current_version"], 6);
    }

    #[test]
    fn illegal_transition_carries_task_id_but_no_versions() {
        let task_id = Uuid::new_v4();
        let body = error_body(&ForgeError::IllegalTransition {
            task_id,
            from: forge_core::model::TaskState::Done,
            to: forge_core::model::TaskState::Waiting,
        });
        assert_eq!(body["task_id"], task_id.to_string());
        assert!(body.get("expected_version").is_none());
        assert!(body.get("current_version").is_none());
    }

    #[test]
    fn token_errors_carry_no_task_id() {
        let body = error_body(&ForgeError::TokenAlreadyUsed);
        assert!(body.get("task_id").is_none());
        assert!(body.get("expected_version").is_none());
        assert!(body.get("current_version").is_none());
    }
}
