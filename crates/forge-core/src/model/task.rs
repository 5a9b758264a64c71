//! Task — the stateful unit of work dispatched to remote workers.
//!
//! ```text
//! waiting ──(deps satisfied)───▶ ready
//! ready   ──(dispatch)─────────▶ queued
//! queued  ──(worker pulls)──────▶ in_progress
//! in_progress ─(worker submits)─▶ review
//! review  ──(QA accept)────────▶ done
//! review  ──(QA reject)────────▶ rejected
//! in_progress ─(worker error)───▶ rejected
//! rejected ─(retry)─────────────▶ ready
//! {waiting, ready} ─(admin block)▶ blocked
//! blocked ──(unblock)───────────▶ ready
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task priority; ordering is `critical > high > medium > low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// The state of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Ready,
    Queued,
    InProgress,
    Review,
    Done,
    Rejected,
    Blocked,
}

impl TaskState {
    /// `done` is the only terminal state — a task in `done` is never
    /// mutated again (invariant 6).
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done)
    }

    /// Whether `(self, to)` is a legal transition per the state diagram.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Waiting, Ready)
                | (Ready, Queued)
                | (Queued, InProgress)
                | (InProgress, Review)
                | (Review, Done)
                | (Review, Rejected)
                | (InProgress, Rejected)
                | (Rejected, Ready)
                | (Waiting, Blocked)
                | (Ready, Blocked)
                | (Blocked, Ready)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Waiting => "waiting",
            TaskState::Ready => "ready",
            TaskState::Queued => "queued",
            TaskState::InProgress => "in_progress",
            TaskState::Review => "review",
            TaskState::Done => "done",
            TaskState::Rejected => "rejected",
            TaskState::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

/// A Task — the unit of work assigned to exactly one worker at a time.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub phase_id: Uuid,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskState,
    /// Starts at 1; incremented by exactly 1 on every successful mutation.
    pub version: i64,
    /// Other task ids in the same project that must be `done` before this
    /// task may enter `ready`.
    #[serde(default)]
    pub depends_on: BTreeSet<Uuid>,

    pub worker_prompt: serde_json::Value,
    pub qa_prompt: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// The stream message id of the task's single open assignment, if any
    /// (`status in {queued, in_progress, review}` implies `Some`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_message_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A newly created task with no dependencies starts `ready`; one with
    /// dependencies starts `waiting`, never `ready` directly.
    pub fn initial_status(depends_on: &BTreeSet<Uuid>) -> TaskState {
        if depends_on.is_empty() {
            TaskState::Ready
        } else {
            TaskState::Waiting
        }
    }

    /// Sort key for the tie-break order: `(priority desc, created_at asc,
    /// id asc)`.
    pub fn ready_order_key(&self) -> (std::cmp::Reverse<Priority>, DateTime<Utc>, Uuid) {
        (std::cmp::Reverse(self.priority), self.created_at, self.id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_deps_starts_ready() {
        assert_eq!(Task::initial_status(&BTreeSet::new()), TaskState::Ready);
    }

    #[test]
    fn deps_start_waiting() {
        let mut deps = BTreeSet::new();
        deps.insert(Uuid::new_v4());
        assert_eq!(Task::initial_status(&deps), TaskState::Waiting);
    }

    #[test]
    fn legal_transitions() {
        assert!(TaskState::Waiting.can_transition_to(TaskState::Ready));
        assert!(TaskState::Ready.can_transition_to(TaskState::Queued));
        assert!(TaskState::Rejected.can_transition_to(TaskState::Ready));
        assert!(!TaskState::Done.can_transition_to(TaskState::Ready));
        assert!(!TaskState::Waiting.can_transition_to(TaskState::Done));
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }
}
