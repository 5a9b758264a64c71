use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A Project — the top-level unit created by the Architect session's
/// finalize step. Owns phases, which own tasks.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Filesystem path of the project's repository checkout.
    pub repo_path: String,
    pub status: ProjectStatus,
    /// Per-project dispatch ceiling; defaults applied at creation time
    /// (1 per phase, 4 per project, per the orchestrator scheduling rule).
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_max_in_flight() -> u32 {
    4
}

/// Project lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Architect session is still producing the design; PM cannot start.
    Design,
    /// The PM Orchestrator loop runs for this project.
    Active,
    /// The loop has exited at the caller's request; dispatched tasks are
    /// unaffected.
    Paused,
    Completed,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectStatus::Design => write!(f, "design"),
            ProjectStatus::Active => write!(f, "active"),
            ProjectStatus::Paused => write!(f, "paused"),
            ProjectStatus::Completed => write!(f, "completed"),
        }
    }
}
