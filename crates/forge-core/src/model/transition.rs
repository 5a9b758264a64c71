use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TaskState;

/// Who initiated a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Pm,
    Worker(Uuid),
    User,
    System,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::Pm => write!(f, "pm"),
            Actor::Worker(id) => write!(f, "worker:{id}"),
            Actor::User => write!(f, "user"),
            Actor::System => write!(f, "system"),
        }
    }
}

/// An append-only audit record of one committed state transition.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub from: TaskState,
    pub to: TaskState,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_message_id: Option<String>,
}
