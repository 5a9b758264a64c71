//! `forge-orchestrator` — the Worker Registry (C4), PM Orchestrator (C5),
//! Dispatcher (C6), and Result Ingester (C7) that sit between the pure
//! `forge-core` state machine and the concrete store/queue adapters.

pub mod dispatch;
pub mod ingest;
pub mod pm;
pub mod registry;

pub use dispatch::dispatch;
pub use ingest::ResultIngester;
pub use pm::{DesignDecomposer, PmStatus, PmSupervisor};
pub use registry::{HeartbeatDirective, HeartbeatOutcome, WorkerRegistry};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    //! A deterministic `DesignDecomposer` for tests: one phase, one task per
    //! entry in `design.tasks`, wired as a linear chain of dependencies, for
    //! tests that need a populated domain object without a live LLM call.

    use std::collections::BTreeSet;

    use chrono::Utc;
    use uuid::Uuid;

    use forge_core::model::{Phase, PhaseStatus, Priority, Project, ProjectStatus, Task, TaskState};
    use forge_core::store::ProjectBatch;

    use crate::pm::DesignDecomposer;

    /// Reads `design` as `{"project_name": str, "tasks": [str, ...]}` and
    /// produces one phase holding a linear dependency chain of tasks.
    pub struct LinearChainDecomposer;

    impl DesignDecomposer for LinearChainDecomposer {
        fn decompose(&self, design: &serde_json::Value) -> forge_core::error::ForgeResult<ProjectBatch> {
            let project_name = design
                .get("project_name")
                .and_then(|v| v.as_str())
                .unwrap_or("untitled")
                .to_string();
            let titles: Vec<String> = design
                .get("tasks")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();

            let now = Utc::now();
            let project_id = Uuid::new_v4();
            let phase_id = Uuid::new_v4();

            let project = Project {
                id: project_id,
                name: project_name,
                description: String::new(),
                repo_path: "/tmp/forge".into(),
                status: ProjectStatus::Design,
                max_in_flight: 4,
                created_at: now,
                updated_at: now,
            };
            let phase = Phase {
                id: phase_id,
                project_id,
                ordinal: 1,
                name: "main".into(),
                description: String::new(),
                branch_name: "feature/main".into(),
                status: PhaseStatus::Pending,
            };

            let mut tasks = Vec::with_capacity(titles.len());
            let mut previous: Option<Uuid> = None;
            for title in titles {
                let id = Uuid::new_v4();
                let mut depends_on = BTreeSet::new();
                if let Some(prev) = previous {
                    depends_on.insert(prev);
                }
                tasks.push(Task {
                    id,
                    project_id,
                    phase_id,
                    title,
                    description: String::new(),
                    priority: Priority::Medium,
                    status: Task::initial_status(&depends_on),
                    version: 1,
                    depends_on,
                    worker_prompt: serde_json::json!({}),
                    qa_prompt: serde_json::json!({}),
                    assigned_worker_id: None,
                    reviewer_id: None,
                    branch_name: Some(phase.branch_name.clone()),
                    commit_hash: None,
                    qa_result: None,
                    output_path: None,
                    error_message: None,
                    assignment_message_id: None,
                    created_at: now,
                    updated_at: now,
                    started_at: None,
                    completed_at: None,
                });
                previous = Some(id);
            }

            Ok(ProjectBatch { project, phases: vec![phase], tasks })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn linear_chain_decomposer_chains_dependencies() {
            let decomposer = LinearChainDecomposer;
            let design = serde_json::json!({
                "project_name": "demo",
                "tasks": ["scaffold", "implement", "test"],
            });
            let batch = decomposer.decompose(&design).unwrap();
            assert_eq!(batch.tasks.len(), 3);
            assert_eq!(batch.tasks[0].status, TaskState::Ready);
            assert_eq!(batch.tasks[1].status, TaskState::Waiting);
            assert!(batch.tasks[1].depends_on.contains(&batch.tasks[0].id));
            assert!(batch.tasks[2].depends_on.contains(&batch.tasks[1].id));
        }
    }
}
