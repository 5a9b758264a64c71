//! The entity model: `Project`, `Phase`, `Task`, `Worker`,
//! `RegistrationToken`, `TransitionRecord`, `StreamMessage`.

mod phase;
mod project;
mod task;
mod token;
mod transition;
mod worker;

pub use phase::{Phase, PhaseStatus};
pub use project::{Project, ProjectStatus};
pub use task::{Priority, Task, TaskState};
pub use token::RegistrationToken;
pub use transition::{Actor, TransitionRecord};
pub use worker::{Worker, WorkerStatus};

/// A message delivered by the stream queue layer, with consumer-group
/// delivery metadata attached (see `forge_core::queue`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StreamMessage {
    pub stream: String,
    pub id: String,
    pub payload: serde_json::Value,
    pub delivery_count: u32,
}
