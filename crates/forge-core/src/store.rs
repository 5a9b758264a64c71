//! The Durable Store port (C1) — a typed CRUD boundary with two guarantees
//! the rest of the core depends on: atomic compare-and-set task mutation,
//! and all-or-nothing project creation.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ForgeResult;
use crate::model::{Phase, Project, RegistrationToken, Task, TaskState, TransitionRecord, Worker};

/// Outcome of a compare-and-set mutation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    VersionMismatch { current: i64 },
    NotFound,
}

/// A project plus its phases and the tasks of each phase, as created in one
/// transactional batch by the PM's design-decomposition step.
#[derive(Debug, Clone)]
pub struct ProjectBatch {
    pub project: Project,
    pub phases: Vec<Phase>,
    pub tasks: Vec<Task>,
}

/// Validate a batch's dependency graph before any `Store` implementation
/// commits it: every `depends_on` id must resolve within the batch, and the
/// graph must be acyclic — a batch containing a dependency cycle is rejected as a unit.
/// Shared by `InMemoryStore` and `forge-postgres::PgStore` so the two
/// backends reject the same batches for the same reason.
pub fn validate_project_batch(batch: &ProjectBatch) -> ForgeResult<()> {
    use crate::error::ForgeError;
    use std::collections::HashMap;

    let ids: std::collections::HashSet<Uuid> = batch.tasks.iter().map(|t| t.id).collect();
    for t in &batch.tasks {
        if t.depends_on.iter().any(|d| !ids.contains(d)) {
            return Err(ForgeError::InvalidDependencyGraph(
                "dependency references a task outside the batch".into(),
            ));
        }
    }

    let by_id: HashMap<Uuid, &Task> = batch.tasks.iter().map(|t| (t.id, t)).collect();
    let mut state: HashMap<Uuid, u8> = HashMap::new(); // 0=unvisited,1=visiting,2=done

    fn visit(id: Uuid, by_id: &HashMap<Uuid, &Task>, state: &mut HashMap<Uuid, u8>) -> bool {
        match state.get(&id) {
            Some(1) => return true,
            Some(2) => return false,
            _ => {}
        }
        state.insert(id, 1);
        if let Some(t) = by_id.get(&id) {
            for dep in &t.depends_on {
                if visit(*dep, by_id, state) {
                    return true;
                }
            }
        }
        state.insert(id, 2);
        false
    }

    if batch.tasks.iter().any(|t| visit(t.id, &by_id, &mut state)) {
        return Err(ForgeError::InvalidDependencyGraph(
            "dependency graph contains a cycle".into(),
        ));
    }
    Ok(())
}

/// The Durable Store port. Implementations must surface connection and
/// serialization failures as `ForgeError::StoreUnavailable` (retriable) and
/// must never retry a `VersionConflict` themselves.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a project with its phases, tasks, and dependency edges as a
    /// single transaction. Fails as a unit (e.g. on a dependency cycle).
    async fn create_project_batch(&self, batch: ProjectBatch) -> ForgeResult<()>;

    async fn get_project(&self, id: Uuid) -> ForgeResult<Option<Project>>;
    async fn set_project_status(
        &self,
        id: Uuid,
        status: crate::model::ProjectStatus,
    ) -> ForgeResult<()>;
    /// Projects in a given status, used at `forge-server` startup to
    /// resume a PM loop for every project left `active` across a restart.
    async fn list_projects_by_status(
        &self,
        status: crate::model::ProjectStatus,
    ) -> ForgeResult<Vec<Project>>;

    async fn get_task(&self, id: Uuid) -> ForgeResult<Option<Task>>;
    async fn list_tasks(&self, project_id: Uuid) -> ForgeResult<Vec<Task>>;
    async fn list_tasks_by_status(
        &self,
        project_id: Uuid,
        statuses: &[TaskState],
    ) -> ForgeResult<Vec<Task>>;
    async fn count_by_status(
        &self,
        project_id: Uuid,
    ) -> ForgeResult<std::collections::HashMap<TaskState, i64>>;

    /// Dependency ids of a task, used by the state machine caller to build
    /// the `DepStatus` slice before proposing a transition.
    async fn get_dependency_statuses(&self, task_id: Uuid) -> ForgeResult<Vec<(Uuid, TaskState)>>;

    /// Atomically apply a previously-validated mutation: write the task at
    /// `expected_version`, append the transition record, and advance the
    /// version by exactly 1.
    async fn compare_and_set_task(
        &self,
        mutated_task: &Task,
        record: &TransitionRecord,
        expected_version: i64,
    ) -> ForgeResult<CasOutcome>;

    async fn list_transitions(&self, task_id: Uuid) -> ForgeResult<Vec<TransitionRecord>>;

    // ── Workers & tokens ──────────────────────────────────────────

    async fn create_registration_token(&self, token: RegistrationToken) -> ForgeResult<()>;
    async fn get_registration_token(&self, token: &str) -> ForgeResult<Option<RegistrationToken>>;
    /// Atomically mark a token consumed by `worker_id`; fails if it is
    /// already consumed (guards against a racing duplicate registration).
    async fn consume_registration_token(&self, token: &str, worker_id: Uuid) -> ForgeResult<bool>;

    async fn upsert_worker(&self, worker: Worker) -> ForgeResult<()>;
    async fn get_worker(&self, id: Uuid) -> ForgeResult<Option<Worker>>;
    async fn list_workers(&self) -> ForgeResult<Vec<Worker>>;
    async fn touch_worker_heartbeat(
        &self,
        id: Uuid,
        at: chrono::DateTime<chrono::Utc>,
    ) -> ForgeResult<()>;
    async fn set_worker_current_task(
        &self,
        id: Uuid,
        task_id: Option<Uuid>,
    ) -> ForgeResult<()>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod memory {
    //! An in-memory `Store` used by unit tests across the workspace so the
    //! state machine, registry, and orchestrator can be exercised without a
    //! live Postgres instance.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::error::ForgeError;
    use crate::model::ProjectStatus;

    #[derive(Default)]
    struct Inner {
        projects: HashMap<Uuid, Project>,
        phases: HashMap<Uuid, Phase>,
        tasks: HashMap<Uuid, Task>,
        transitions: HashMap<Uuid, Vec<TransitionRecord>>,
        tokens: HashMap<String, RegistrationToken>,
        workers: HashMap<Uuid, Worker>,
    }

    /// In-memory `Store`, gated behind the `test-support` feature.
    #[derive(Default)]
    pub struct InMemoryStore(Mutex<Inner>);

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Store for InMemoryStore {
        async fn create_project_batch(&self, batch: ProjectBatch) -> ForgeResult<()> {
            super::validate_project_batch(&batch)?;

            let mut inner = self.0.lock().unwrap();
            inner.projects.insert(batch.project.id, batch.project);
            for p in batch.phases {
                inner.phases.insert(p.id, p);
            }
            for t in batch.tasks {
                inner.tasks.insert(t.id, t);
            }
            Ok(())
        }

        async fn get_project(&self, id: Uuid) -> ForgeResult<Option<Project>> {
            Ok(self.0.lock().unwrap().projects.get(&id).cloned())
        }

        async fn set_project_status(&self, id: Uuid, status: ProjectStatus) -> ForgeResult<()> {
            let mut inner = self.0.lock().unwrap();
            let p = inner
                .projects
                .get_mut(&id)
                .ok_or(ForgeError::NotFound { kind: "project", id })?;
            p.status = status;
            Ok(())
        }

        async fn list_projects_by_status(
            &self,
            status: ProjectStatus,
        ) -> ForgeResult<Vec<Project>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .projects
                .values()
                .filter(|p| p.status == status)
                .cloned()
                .collect())
        }

        async fn get_task(&self, id: Uuid) -> ForgeResult<Option<Task>> {
            Ok(self.0.lock().unwrap().tasks.get(&id).cloned())
        }

        async fn list_tasks(&self, project_id: Uuid) -> ForgeResult<Vec<Task>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .tasks
                .values()
                .filter(|t| t.project_id == project_id)
                .cloned()
                .collect())
        }

        async fn list_tasks_by_status(
            &self,
            project_id: Uuid,
            statuses: &[TaskState],
        ) -> ForgeResult<Vec<Task>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .tasks
                .values()
                .filter(|t| t.project_id == project_id && statuses.contains(&t.status))
                .cloned()
                .collect())
        }

        async fn count_by_status(
            &self,
            project_id: Uuid,
        ) -> ForgeResult<std::collections::HashMap<TaskState, i64>> {
            let mut counts = std::collections::HashMap::new();
            for t in self.0.lock().unwrap().tasks.values() {
                if t.project_id == project_id {
                    *counts.entry(t.status).or_insert(0) += 1;
                }
            }
            Ok(counts)
        }

        async fn get_dependency_statuses(
            &self,
            task_id: Uuid,
        ) -> ForgeResult<Vec<(Uuid, TaskState)>> {
            let inner = self.0.lock().unwrap();
            let task = inner
                .tasks
                .get(&task_id)
                .ok_or(ForgeError::NotFound { kind: "task", id: task_id })?;
            Ok(task
                .depends_on
                .iter()
                .filter_map(|d| inner.tasks.get(d).map(|t| (t.id, t.status)))
                .collect())
        }

        async fn compare_and_set_task(
            &self,
            mutated_task: &Task,
            record: &TransitionRecord,
            expected_version: i64,
        ) -> ForgeResult<CasOutcome> {
            let mut inner = self.0.lock().unwrap();
            let Some(current) = inner.tasks.get(&mutated_task.id).cloned() else {
                return Ok(CasOutcome::NotFound);
            };
            if current.version != expected_version {
                return Ok(CasOutcome::VersionMismatch {
                    current: current.version,
                });
            }
            inner.tasks.insert(mutated_task.id, mutated_task.clone());
            inner
                .transitions
                .entry(mutated_task.id)
                .or_default()
                .push(record.clone());
            Ok(CasOutcome::Applied)
        }

        async fn list_transitions(&self, task_id: Uuid) -> ForgeResult<Vec<TransitionRecord>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .transitions
                .get(&task_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn create_registration_token(&self, token: RegistrationToken) -> ForgeResult<()> {
            self.0
                .lock()
                .unwrap()
                .tokens
                .insert(token.token.clone(), token);
            Ok(())
        }

        async fn get_registration_token(
            &self,
            token: &str,
        ) -> ForgeResult<Option<RegistrationToken>> {
            Ok(self.0.lock().unwrap().tokens.get(token).cloned())
        }

        async fn consume_registration_token(
            &self,
            token: &str,
            worker_id: Uuid,
        ) -> ForgeResult<bool> {
            let mut inner = self.0.lock().unwrap();
            let Some(t) = inner.tokens.get_mut(token) else {
                return Ok(false);
            };
            if t.consumed_by.is_some() {
                return Ok(false);
            }
            t.consumed_by = Some(worker_id);
            Ok(true)
        }

        async fn upsert_worker(&self, worker: Worker) -> ForgeResult<()> {
            self.0.lock().unwrap().workers.insert(worker.id, worker);
            Ok(())
        }

        async fn get_worker(&self, id: Uuid) -> ForgeResult<Option<Worker>> {
            Ok(self.0.lock().unwrap().workers.get(&id).cloned())
        }

        async fn list_workers(&self) -> ForgeResult<Vec<Worker>> {
            Ok(self.0.lock().unwrap().workers.values().cloned().collect())
        }

        async fn touch_worker_heartbeat(
            &self,
            id: Uuid,
            at: chrono::DateTime<chrono::Utc>,
        ) -> ForgeResult<()> {
            let mut inner = self.0.lock().unwrap();
            let w = inner
                .workers
                .get_mut(&id)
                .ok_or(ForgeError::NotFound { kind: "worker", id })?;
            w.last_heartbeat = at;
            Ok(())
        }

        async fn set_worker_current_task(
            &self,
            id: Uuid,
            task_id: Option<Uuid>,
        ) -> ForgeResult<()> {
            let mut inner = self.0.lock().unwrap();
            let w = inner
                .workers
                .get_mut(&id)
                .ok_or(ForgeError::NotFound { kind: "worker", id })?;
            w.current_task_id = task_id;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForgeError;
    use crate::model::{Priority, ProjectStatus};
    use std::collections::BTreeSet;

    fn task(id: Uuid, project_id: Uuid, phase_id: Uuid, depends_on: BTreeSet<Uuid>) -> Task {
        let now = chrono::Utc::now();
        Task {
            id,
            project_id,
            phase_id,
            title: "t".into(),
            description: String::new(),
            priority: Priority::Medium,
            status: Task::initial_status(&depends_on),
            version: 1,
            depends_on,
            worker_prompt: serde_json::json!({}),
            qa_prompt: serde_json::json!({}),
            assigned_worker_id: None,
            reviewer_id: None,
            branch_name: None,
            commit_hash: None,
            qa_result: None,
            output_path: None,
            error_message: None,
            assignment_message_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn cycle_is_rejected_as_a_unit() {
        let project_id = Uuid::new_v4();
        let phase_id = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut a_deps = BTreeSet::new();
        a_deps.insert(b);
        let mut b_deps = BTreeSet::new();
        b_deps.insert(a);

        let batch = ProjectBatch {
            project: Project {
                id: project_id,
                name: "p".into(),
                description: String::new(),
                repo_path: "/tmp".into(),
                status: ProjectStatus::Design,
                max_in_flight: 4,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
            phases: vec![],
            tasks: vec![
                task(a, project_id, phase_id, a_deps),
                task(b, project_id, phase_id, b_deps),
            ],
        };

        let err = validate_project_batch(&batch).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidDependencyGraph(_)));
    }

    #[test]
    fn dependency_outside_batch_is_rejected() {
        let project_id = Uuid::new_v4();
        let phase_id = Uuid::new_v4();
        let mut deps = BTreeSet::new();
        deps.insert(Uuid::new_v4());

        let batch = ProjectBatch {
            project: Project {
                id: project_id,
                name: "p".into(),
                description: String::new(),
                repo_path: "/tmp".into(),
                status: ProjectStatus::Design,
                max_in_flight: 4,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
            phases: vec![],
            tasks: vec![task(Uuid::new_v4(), project_id, phase_id, deps)],
        };

        assert!(validate_project_batch(&batch).is_err());
    }

    #[tokio::test]
    async fn in_memory_store_rejects_cyclic_batch() {
        let store = memory::InMemoryStore::new();
        let project_id = Uuid::new_v4();
        let phase_id = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut a_deps = BTreeSet::new();
        a_deps.insert(b);
        let mut b_deps = BTreeSet::new();
        b_deps.insert(a);

        let batch = ProjectBatch {
            project: Project {
                id: project_id,
                name: "p".into(),
                description: String::new(),
                repo_path: "/tmp".into(),
                status: ProjectStatus::Design,
                max_in_flight: 4,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
            phases: vec![],
            tasks: vec![
                task(a, project_id, phase_id, a_deps),
                task(b, project_id, phase_id, b_deps),
            ],
        };

        assert!(store.create_project_batch(batch).await.is_err());
        assert!(store.get_project(project_id).await.unwrap().is_none());
    }
}
