//! Domain error type shared across every Forge crate.
//!
//! Mirrors the retry/propagation table in the task-state-machine design:
//! store and queue failures are retriable, everything else is deterministic.

use thiserror::Error;
use uuid::Uuid;

use crate::model::TaskState;

/// Errors that can occur anywhere in the task-execution backbone.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// The `(from, to)` pair is not in the legal-transitions set.
    #[error("illegal transition for task {task_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        task_id: Uuid,
        from: TaskState,
        to: TaskState,
    },

    /// `expected_version` did not match the task's current version.
    #[error("version conflict on task {task_id}: expected {expected}, found {current}")]
    VersionConflict {
        task_id: Uuid,
        expected: i64,
        current: i64,
    },

    /// Entering `ready` requires every dependency to be `done`.
    #[error("task {task_id} has unsatisfied dependencies: {unmet:?}")]
    DependencyNotSatisfied { task_id: Uuid, unmet: Vec<Uuid> },

    /// A state-specific precondition besides dependency satisfaction failed.
    #[error("missing prerequisite for task {task_id} entering {to:?}: {detail}")]
    MissingPrerequisite {
        task_id: Uuid,
        to: TaskState,
        detail: String,
    },

    /// The registration token does not exist.
    #[error("registration token not found")]
    TokenNotFound,

    /// The registration token has already been consumed.
    #[error("registration token already used")]
    TokenAlreadyUsed,

    /// The registration token has expired.
    #[error("registration token expired")]
    TokenExpired,

    /// The registration token has been administratively revoked.
    #[error("registration token revoked")]
    TokenRevoked,

    /// Worker id/secret pair did not validate.
    #[error("invalid worker credentials for {worker_id}")]
    InvalidWorkerCredentials { worker_id: Uuid },

    /// No worker currently satisfies the task's capability requirements.
    #[error("no eligible worker for task {task_id}")]
    NoEligibleWorker { task_id: Uuid },

    /// The store could not be reached; retriable with backoff.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The stream queue could not be reached; retriable with backoff.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// A version conflict persisted across every retry; the update is
    /// logged and dropped, relying on the actor's next cycle to reconcile.
    #[error("lost update on task {task_id} after {attempts} retries")]
    LostUpdate { task_id: Uuid, attempts: u32 },

    /// Starting a project whose design has not been finalized.
    #[error("project {project_id} is not ready to start")]
    ProjectNotReady { project_id: Uuid },

    /// A referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    /// A dependency edge would create a cycle, or references a task outside
    /// the project.
    #[error("invalid dependency graph: {0}")]
    InvalidDependencyGraph(String),

    /// Catch-all for adapter errors that don't need their own variant.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForgeError {
    /// Whether the caller should retry this error with backoff rather than
    /// surface it immediately.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ForgeError::StoreUnavailable(_) | ForgeError::QueueUnavailable(_)
        )
    }

    /// The HTTP status code the `forge-server` error envelope should use.
    pub fn http_status(&self) -> u16 {
        match self {
            ForgeError::VersionConflict { .. } | ForgeError::IllegalTransition { .. } => 409,
            ForgeError::DependencyNotSatisfied { .. } | ForgeError::MissingPrerequisite { .. } => {
                412
            }
            ForgeError::TokenNotFound
            | ForgeError::TokenAlreadyUsed
            | ForgeError::TokenExpired
            | ForgeError::TokenRevoked
            | ForgeError::InvalidWorkerCredentials { .. } => 401,
            ForgeError::NotFound { .. } => 404,
            ForgeError::ProjectNotReady { .. } | ForgeError::InvalidDependencyGraph(_) => 400,
            ForgeError::StoreUnavailable(_) | ForgeError::QueueUnavailable(_) => 503,
            ForgeError::NoEligibleWorker { .. } | ForgeError::LostUpdate { .. } => 500,
            ForgeError::Other(_) => 500,
        }
    }

    /// Stable machine-readable kind string for the `{error: {kind, ...}}` envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            ForgeError::IllegalTransition { .. } => "illegal_transition",
            ForgeError::VersionConflict { .. } => "version_conflict",
            ForgeError::DependencyNotSatisfied { .. } => "dependency_not_satisfied",
            ForgeError::MissingPrerequisite { .. } => "missing_prerequisite",
            ForgeError::TokenNotFound => "token_not_found",
            ForgeError::TokenAlreadyUsed => "token_already_used",
            ForgeError::TokenExpired => "token_expired",
            ForgeError::TokenRevoked => "token_revoked",
            ForgeError::InvalidWorkerCredentials { .. } => "invalid_worker_credentials",
            ForgeError::NoEligibleWorker { .. } => "no_eligible_worker",
            ForgeError::StoreUnavailable(_) => "store_unavailable",
            ForgeError::QueueUnavailable(_) => "queue_unavailable",
            ForgeError::LostUpdate { .. } => "lost_update",
            ForgeError::ProjectNotReady { .. } => "project_not_ready",
            ForgeError::NotFound { .. } => "not_found",
            ForgeError::InvalidDependencyGraph(_) => "invalid_dependency_graph",
            ForgeError::Other(_) => "internal",
        }
    }
}

/// Result alias used throughout the backbone.
pub type ForgeResult<T> = Result<T, ForgeError>;
