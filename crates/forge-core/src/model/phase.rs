use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A Phase — an ordinal grouping of tasks within a project, backed by its
/// own branch.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub id: Uuid,
    pub project_id: Uuid,
    /// 1-based, unique within the project.
    pub ordinal: i32,
    pub name: String,
    pub description: String,
    /// Unique within the project.
    pub branch_name: String,
    pub status: PhaseStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Active,
    Completed,
}
