//! The Result Ingester (C7) — a long-running consumer of `tasks:results`
//! under group `ingesters`. Maps worker result `kind`s onto the task state
//! machine, retries `VersionConflict` up to 3 times, dead-letters
//! deterministic failures, and leaves transient failures unacknowledged
//! for redelivery. A companion janitor sweeps stale pending entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use forge_core::backoff;
use forge_core::board::{BoardBus, BoardEvent};
use forge_core::error::{ForgeError, ForgeResult};
use forge_core::machine::{self, DepStatus};
use forge_core::model::{Actor, TaskState};
use forge_core::queue::{groups, streams, GroupStart, StreamQueue};
use forge_core::store::{CasOutcome, Store};

use crate::registry::WorkerRegistry;

/// The janitor's idle cutoff and sweep interval (spec §4.7 last line).
const JANITOR_IDLE_MS: i64 = 60_000;
const JANITOR_SWEEP: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ResultKind {
    Started,
    Submitted,
    QaAccept,
    QaReject,
    Error,
}

#[derive(Debug, Deserialize)]
struct ResultMessage {
    task_id: Uuid,
    worker_id: Uuid,
    worker_secret: String,
    kind: ResultKind,
    #[serde(default)]
    payload: serde_json::Value,
    expected_version: i64,
}

/// `ResultIngester` — owns the consumer loop and the janitor.
pub struct ResultIngester<S: Store, Q: StreamQueue> {
    store: Arc<S>,
    queue: Arc<Q>,
    registry: Arc<WorkerRegistry<S>>,
    board: BoardBus,
    consumer_name: String,
}

impl<S: Store, Q: StreamQueue> ResultIngester<S, Q> {
    pub fn new(
        store: Arc<S>,
        queue: Arc<Q>,
        registry: Arc<WorkerRegistry<S>>,
        board: BoardBus,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            board,
            consumer_name: consumer_name.into(),
        }
    }

    /// Run the consume/apply/ack loop until `cancel` fires. Not normally
    /// called directly in tests — see `process_one`.
    pub async fn run(&self, cancel: tokio_util::sync::CancellationToken, block_ms: u64) {
        self.queue
            .ensure_group(streams::RESULTS, groups::INGESTERS, GroupStart::New)
            .await
            .ok();

        loop {
            if cancel.is_cancelled() {
                return;
            }
            let messages = match self
                .queue
                .consume(streams::RESULTS, groups::INGESTERS, &self.consumer_name, 10, block_ms)
                .await
            {
                Ok(m) => m,
                Err(err) => {
                    warn!(%err, "result ingester consume failed, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff::SCHEDULE_MS[0])).await;
                    continue;
                }
            };
            for msg in messages {
                self.handle(&msg.id, &msg.payload).await;
            }
        }
    }

    /// Sweep `pending(tasks:results, ingesters)` every 30s, reclaiming
    /// anything idle past 60s onto a fresh consumer (spec §4.7 janitor).
    pub async fn run_janitor(&self, cancel: tokio_util::sync::CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(JANITOR_SWEEP).await;
            if let Err(err) = self.sweep_once().await {
                warn!(%err, "janitor sweep failed");
            }
        }
    }

    async fn sweep_once(&self) -> ForgeResult<()> {
        let pending = self.queue.pending(streams::RESULTS, groups::INGESTERS).await?;
        let stale: Vec<String> = pending
            .into_iter()
            .filter(|p| p.idle_ms as i64 > JANITOR_IDLE_MS)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        let claimed = self
            .queue
            .claim(
                streams::RESULTS,
                groups::INGESTERS,
                &self.consumer_name,
                JANITOR_IDLE_MS,
                &stale,
            )
            .await?;
        info!(count = claimed.len(), "janitor reclaimed stale result messages");
        for msg in claimed {
            self.handle(&msg.id, &msg.payload).await;
        }
        Ok(())
    }

    /// Apply one message's intended transition and ack/dead-letter/leave-
    /// pending as appropriate. Exposed at crate visibility for tests.
    pub(crate) async fn handle(&self, message_id: &str, payload: &serde_json::Value) {
        let parsed: Result<ResultMessage, _> = serde_json::from_value(payload.clone());
        let Ok(msg) = parsed else {
            // Malformed payload can never become applicable: dead-letter it.
            self.dead_letter(message_id, payload, "malformed result payload").await;
            self.ack(message_id).await;
            return;
        };

        if self.registry.verify(msg.worker_id, &msg.worker_secret).await.is_err() {
            warn!(task_id = %msg.task_id, worker_id = %msg.worker_id, "dropping result from unverified worker");
            self.ack(message_id).await;
            return;
        }

        for attempt in 0..backoff::MAX_ATTEMPTS {
            match self.apply_once(&msg).await {
                Ok(()) => {
                    self.ack(message_id).await;
                    return;
                }
                Err(ForgeError::VersionConflict { .. }) if attempt + 1 < backoff::MAX_ATTEMPTS => {
                    backoff::wait(attempt).await;
                    continue;
                }
                Err(ForgeError::VersionConflict { task_id, .. }) => {
                    warn!(%task_id, "lost update after retries");
                    self.ack(message_id).await;
                    return;
                }
                Err(err @ (ForgeError::IllegalTransition { .. } | ForgeError::MissingPrerequisite { .. })) => {
                    self.dead_letter(message_id, payload, &err.to_string()).await;
                    self.ack(message_id).await;
                    return;
                }
                Err(ForgeError::StoreUnavailable(reason)) => {
                    warn!(%reason, "store unavailable, leaving result message pending for redelivery");
                    return;
                }
                Err(err) => {
                    error!(%err, "unexpected error applying result");
                    self.dead_letter(message_id, payload, &err.to_string()).await;
                    self.ack(message_id).await;
                    return;
                }
            }
        }
    }

    async fn apply_once(&self, msg: &ResultMessage) -> ForgeResult<()> {
        let task = self
            .store
            .get_task(msg.task_id)
            .await?
            .ok_or(ForgeError::NotFound { kind: "task", id: msg.task_id })?;

        let (to, reason) = match msg.kind {
            ResultKind::Started => (TaskState::InProgress, None),
            ResultKind::Submitted => (TaskState::Review, None),
            ResultKind::QaAccept => (TaskState::Done, None),
            ResultKind::QaReject => (TaskState::Rejected, Some("qa_reject".to_string())),
            ResultKind::Error => (TaskState::Rejected, Some("worker_error".to_string())),
        };

        let mut staged = task.clone();
        match msg.kind {
            ResultKind::Submitted => {
                staged.commit_hash = msg.payload.get("commit_hash").and_then(|v| v.as_str()).map(str::to_string);
                staged.branch_name = msg.payload.get("branch_name").and_then(|v| v.as_str()).map(str::to_string)
                    .or(staged.branch_name);
                staged.output_path = msg.payload.get("output_path").and_then(|v| v.as_str()).map(str::to_string);
            }
            ResultKind::QaAccept => {
                let mut result = msg.payload.get("qa_result").cloned().unwrap_or(serde_json::json!({}));
                if let Some(obj) = result.as_object_mut() {
                    obj.insert("accepted".into(), serde_json::Value::Bool(true));
                }
                staged.qa_result = Some(result);
            }
            ResultKind::QaReject => {
                let mut result = msg.payload.get("qa_result").cloned().unwrap_or(serde_json::json!({}));
                if let Some(obj) = result.as_object_mut() {
                    obj.insert("accepted".into(), serde_json::Value::Bool(false));
                }
                staged.qa_result = Some(result);
            }
            ResultKind::Error => {
                staged.error_message = msg.payload.get("error_message").and_then(|v| v.as_str()).map(str::to_string);
            }
            ResultKind::Started => {}
        }

        let dep_statuses: Vec<DepStatus> = self
            .store
            .get_dependency_statuses(msg.task_id)
            .await?
            .into_iter()
            .map(|(task_id, status)| DepStatus { task_id, status })
            .collect();

        let actor = Actor::Worker(msg.worker_id);
        let mutation = machine::propose_transition(
            &staged,
            to,
            actor,
            reason,
            msg.expected_version,
            &dep_statuses,
        )?;

        match self
            .store
            .compare_and_set_task(&mutation.task, &mutation.record, msg.expected_version)
            .await?
        {
            CasOutcome::Applied => {
                if matches!(mutation.task.status, TaskState::Rejected | TaskState::Done) {
                    self.registry.set_current_task(msg.worker_id, None).await.ok();
                }
                self.publish_board_event(&mutation.task, task.status);
                if mutation.task.status == TaskState::Done {
                    self.propagate_downstream_ready(mutation.task.project_id, mutation.task.id)
                        .await
                        .ok();
                }
                Ok(())
            }
            CasOutcome::VersionMismatch { current } => Err(ForgeError::VersionConflict {
                task_id: msg.task_id,
                expected: msg.expected_version,
                current,
            }),
            CasOutcome::NotFound => Err(ForgeError::NotFound { kind: "task", id: msg.task_id }),
        }
    }

    /// On `done`, re-evaluate every task of the project that depends on it
    /// and move the newly-unblocked ones `waiting -> ready` (spec §4.3
    /// "Entering done triggers re-evaluation...", §9 "Dependency
    /// re-evaluation"). `forge-orchestrator::pm` performs the same
    /// re-evaluation on its tick, so a missed notification here is not
    /// fatal, only a latency cost until the next tick.
    async fn propagate_downstream_ready(&self, project_id: Uuid, done_task_id: Uuid) -> ForgeResult<()> {
        let tasks = self.store.list_tasks(project_id).await?;
        let done_ids: std::collections::HashSet<Uuid> = tasks
            .iter()
            .filter(|t| t.status == TaskState::Done)
            .map(|t| t.id)
            .collect();
        let newly_ready = machine::newly_ready_after_done(tasks.iter(), &done_ids);

        for task_id in newly_ready {
            let Some(task) = self.store.get_task(task_id).await? else { continue };
            let dep_statuses: Vec<DepStatus> = self
                .store
                .get_dependency_statuses(task_id)
                .await?
                .into_iter()
                .map(|(task_id, status)| DepStatus { task_id, status })
                .collect();
            let mutation = match machine::propose_transition(
                &task,
                TaskState::Ready,
                Actor::System,
                Some(format!("unblocked by completion of {done_task_id}")),
                task.version,
                &dep_statuses,
            ) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if let CasOutcome::Applied = self
                .store
                .compare_and_set_task(&mutation.task, &mutation.record, task.version)
                .await?
            {
                self.publish_board_event(&mutation.task, TaskState::Waiting);
            }
        }
        Ok(())
    }

    fn publish_board_event(&self, task: &forge_core::model::Task, from: TaskState) {
        self.board.publish(
            task.project_id,
            BoardEvent::TaskMoved {
                task_id: task.id,
                from: from.to_string(),
                to: task.status.to_string(),
                ts: Utc::now(),
            },
        );
    }

    async fn ack(&self, message_id: &str) {
        if let Err(err) = self.queue.ack(streams::RESULTS, groups::INGESTERS, message_id).await {
            warn!(%err, message_id, "failed to ack result message");
        }
    }

    async fn dead_letter(&self, message_id: &str, payload: &serde_json::Value, reason: &str) {
        let dlq_payload = serde_json::json!({
            "original_stream": streams::RESULTS,
            "original_message_id": message_id,
            "reason": reason,
            "payload": payload,
        });
        if let Err(err) = self.queue.publish(streams::DLQ, dlq_payload).await {
            error!(%err, message_id, "failed to dead-letter result message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::{Priority, Project, ProjectStatus, RegistrationToken, Task};
    use forge_core::queue::memory::MemoryStreamQueue;
    use forge_core::store::memory::InMemoryStore;
    use forge_core::store::ProjectBatch;
    use std::collections::BTreeSet;

    async fn setup() -> (
        Arc<InMemoryStore>,
        Arc<MemoryStreamQueue>,
        Arc<WorkerRegistry<InMemoryStore>>,
        Uuid,
        Uuid,
        Uuid,
        String,
    ) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(MemoryStreamQueue::new());
        let registry = Arc::new(WorkerRegistry::new(store.clone(), 30));

        store
            .create_registration_token(RegistrationToken {
                token: "tok".into(),
                display_name: None,
                created_at: Utc::now(),
                expires_at: None,
                revoked: false,
                consumed_by: None,
            })
            .await
            .unwrap();
        let (worker_id, secret) = registry
            .register("tok", "w".into(), "linux".into(), "docker".into(), serde_json::json!({}))
            .await
            .unwrap();

        let project_id = Uuid::new_v4();
        let phase_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let now = Utc::now();
        let project = Project {
            id: project_id,
            name: "p".into(),
            description: String::new(),
            repo_path: "/tmp".into(),
            status: ProjectStatus::Active,
            max_in_flight: 4,
            created_at: now,
            updated_at: now,
        };
        let mut task = Task {
            id: task_id,
            project_id,
            phase_id,
            title: "t".into(),
            description: String::new(),
            priority: Priority::Medium,
            status: TaskState::Queued,
            version: 1,
            depends_on: BTreeSet::new(),
            worker_prompt: serde_json::json!({}),
            qa_prompt: serde_json::json!({}),
            assigned_worker_id: Some(worker_id),
            reviewer_id: None,
            branch_name: Some("feature/t".into()),
            commit_hash: None,
            qa_result: None,
            output_path: None,
            error_message: None,
            assignment_message_id: Some("1-0".into()),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        task.status = TaskState::Queued;

        store
            .create_project_batch(ProjectBatch {
                project,
                phases: vec![],
                tasks: vec![task],
            })
            .await
            .unwrap();
        registry.set_current_task(worker_id, Some(task_id)).await.unwrap();

        (store, queue, registry, project_id, task_id, worker_id, secret)
    }

    #[tokio::test]
    async fn started_then_submitted_moves_task_to_review_and_publishes_board_event() {
        let (store, queue, registry, project_id, task_id, worker_id, secret) = setup().await;
        let board = BoardBus::new();
        let mut sub = board.subscribe(project_id);
        let ingester = ResultIngester::new(store.clone(), queue, registry, board, "ingester-1");

        let started = serde_json::json!({
            "task_id": task_id,
            "worker_id": worker_id,
            "worker_secret": secret,
            "kind": "started",
            "payload": {},
            "expected_version": 1,
        });
        ingester.handle("1-0", &started).await;
        let in_progress = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(in_progress.status, TaskState::InProgress);
        assert!(sub.recv().await.is_some());

        let submitted = serde_json::json!({
            "task_id": task_id,
            "worker_id": worker_id,
            "worker_secret": secret,
            "kind": "submitted",
            "payload": {"commit_hash": "abc123", "output_path": "/out"},
            "expected_version": in_progress.version,
        });
        ingester.handle("2-0", &submitted).await;

        let reviewed = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(reviewed.status, TaskState::Review);
        assert_eq!(reviewed.commit_hash.as_deref(), Some("abc123"));
        assert!(sub.recv().await.is_some());
    }

    #[tokio::test]
    async fn illegal_transition_is_dead_lettered() {
        let (store, queue, registry, _project_id, task_id, worker_id, secret) = setup().await;
        let board = BoardBus::new();
        let ingester = ResultIngester::new(store.clone(), queue.clone(), registry, board, "ingester-1");

        // `qa_accept` on a `queued` task is illegal (only `review -> done` is).
        let payload = serde_json::json!({
            "task_id": task_id,
            "worker_id": worker_id,
            "worker_secret": secret,
            "kind": "qa_accept",
            "payload": {"qa_result": {}},
            "expected_version": 1,
        });
        ingester.handle("1-0", &payload).await;

        let dlq = queue.consume(streams::DLQ, "g", "c", 10, 0).await.unwrap();
        assert_eq!(dlq.len(), 1);

        let after = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskState::Queued);
    }

    #[tokio::test]
    async fn unverified_worker_is_dropped_without_dead_letter() {
        let (store, queue, registry, _project_id, task_id, worker_id, _secret) = setup().await;
        let board = BoardBus::new();
        let ingester = ResultIngester::new(store.clone(), queue.clone(), registry, board, "ingester-1");

        let payload = serde_json::json!({
            "task_id": task_id,
            "worker_id": worker_id,
            "worker_secret": "wrong-secret",
            "kind": "started",
            "payload": {},
            "expected_version": 1,
        });
        ingester.handle("1-0", &payload).await;

        let dlq = queue.consume(streams::DLQ, "g", "c", 10, 0).await.unwrap();
        assert!(dlq.is_empty());
        let after = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskState::Queued);
    }
}
