//! The Dispatcher (C6) — `dispatch(task)`: resolve a worker, reserve the
//! task (`ready -> queued`), publish the assignment, and record the
//! resulting stream message id, with rollback if the second write races.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use forge_core::backoff;
use forge_core::error::{ForgeError, ForgeResult};
use forge_core::model::{Actor, ProjectStatus, Task, TaskState};
use forge_core::queue::{streams, StreamQueue};
use forge_core::store::{CasOutcome, Store};

use crate::registry::WorkerRegistry;

/// Attempt to dispatch `task` (must currently be `ready`). Returns `Ok(())`
/// both when the dispatch succeeds and when it is silently deferred
/// (`NoEligibleWorker`, or a `ready -> queued` race lost 3 times) — those
/// are not errors the caller needs to act on; the PM simply retries the
/// task on its next tick.
pub async fn dispatch<S: Store, Q: StreamQueue>(
    store: &S,
    queue: &Q,
    registry: &WorkerRegistry<S>,
    task: Task,
) -> ForgeResult<()> {
    let Some(project) = store.get_project(task.project_id).await? else {
        return Err(ForgeError::NotFound {
            kind: "project",
            id: task.project_id,
        });
    };
    if project.status != ProjectStatus::Active {
        return Ok(());
    }

    let Some(worker) = registry
        .find_idle_with_capabilities(&task.worker_prompt.get("required_capabilities").cloned().unwrap_or(serde_json::json!({})))
        .await?
    else {
        return Ok(());
    };

    let mut current = task;
    for attempt in 0..backoff::MAX_ATTEMPTS {
        match reserve(store, &current, worker.id).await? {
            Some(reserved) => {
                return publish_and_record(store, queue, registry, reserved, worker.id).await;
            }
            None => {
                // Lost the race: re-read and retry, unless we're out of
                // attempts, in which case give up silently.
                let Some(fresh) = store.get_task(current.id).await? else {
                    return Ok(());
                };
                if fresh.status != TaskState::Ready {
                    return Ok(());
                }
                current = fresh;
                if attempt + 1 < backoff::MAX_ATTEMPTS {
                    backoff::wait(attempt).await;
                }
            }
        }
    }
    Ok(())
}

/// Try the `ready -> queued` compare-and-set with `worker_id` staged.
/// Returns `Some(task)` on success, `None` on a lost race.
///
/// This step precedes the publish, so the task is briefly `queued`
/// without an `assignment_message_id` — that invariant holds for the
/// *committed* sequence as a whole: the publish step either attaches
/// the id or rolls this reservation back to `ready`.
async fn reserve<S: Store>(store: &S, task: &Task, worker_id: Uuid) -> ForgeResult<Option<Task>> {
    if task.status != TaskState::Ready {
        return Ok(None);
    }

    let mut staged = task.clone();
    staged.status = TaskState::Queued;
    staged.version = task.version + 1;
    staged.updated_at = Utc::now();
    staged.assigned_worker_id = Some(worker_id);

    let record = forge_core::model::TransitionRecord {
        id: Uuid::new_v4(),
        task_id: task.id,
        from: TaskState::Ready,
        to: TaskState::Queued,
        actor: Actor::Pm,
        reason: None,
        at: staged.updated_at,
        stream_message_id: None,
    };

    match store
        .compare_and_set_task(&staged, &record, task.version)
        .await?
    {
        CasOutcome::Applied => Ok(Some(staged)),
        CasOutcome::VersionMismatch { .. } | CasOutcome::NotFound => Ok(None),
    }
}

/// Publish the assignment record and attach its stream message id to the
/// reserved task. If this second write races (another actor already moved
/// the task on), roll back: un-publish is impossible on an append-only log,
/// so instead transition the task back to `ready` and free the worker.
async fn publish_and_record<S: Store, Q: StreamQueue>(
    store: &S,
    queue: &Q,
    registry: &WorkerRegistry<S>,
    reserved: Task,
    worker_id: Uuid,
) -> ForgeResult<()> {
    let payload = serde_json::json!({
        "task_id": reserved.id,
        "project_id": reserved.project_id,
        "worker_id": worker_id,
        "assigned_at": Utc::now(),
        "branch_name": reserved.branch_name,
        "worker_prompt": reserved.worker_prompt,
        "qa_prompt": reserved.qa_prompt,
        "expected_version": reserved.version,
    });

    let message_id = match queue.publish(&streams::assign(reserved.project_id), payload).await {
        Ok(id) => id,
        Err(err) => {
            rollback(store, &reserved).await?;
            return Err(err);
        }
    };

    let mut with_message = reserved.clone();
    with_message.assignment_message_id = Some(message_id);

    // Re-stamp the same state with the real message id: not a state
    // transition (queued -> queued is not in the legal set), so this is a
    // direct second CAS write rather than a `propose_transition` call.
    let record = forge_core::model::TransitionRecord {
        id: Uuid::new_v4(),
        task_id: with_message.id,
        from: TaskState::Queued,
        to: TaskState::Queued,
        actor: Actor::Pm,
        reason: Some("attach assignment message id".into()),
        at: Utc::now(),
        stream_message_id: with_message.assignment_message_id.clone(),
    };

    match store
        .compare_and_set_task(&with_message, &record, reserved.version)
        .await?
    {
        CasOutcome::Applied => {
            registry.set_current_task(worker_id, Some(reserved.id)).await?;
            info!(task_id = %reserved.id, worker_id = %worker_id, "dispatched task");
            Ok(())
        }
        CasOutcome::VersionMismatch { .. } | CasOutcome::NotFound => {
            warn!(task_id = %reserved.id, "lost race attaching assignment id, rolling back to ready");
            rollback(store, &reserved).await
        }
    }
}

async fn rollback<S: Store>(store: &S, reserved: &Task) -> ForgeResult<()> {
    let mut back = reserved.clone();
    back.status = TaskState::Ready;
    back.assigned_worker_id = None;
    back.assignment_message_id = None;
    back.version = reserved.version + 1;
    back.updated_at = Utc::now();

    let record = forge_core::model::TransitionRecord {
        id: Uuid::new_v4(),
        task_id: reserved.id,
        from: TaskState::Queued,
        to: TaskState::Ready,
        actor: Actor::System,
        reason: Some("rollback: publish raced a concurrent transition".into()),
        at: Utc::now(),
        stream_message_id: None,
    };

    match store
        .compare_and_set_task(&back, &record, reserved.version)
        .await?
    {
        CasOutcome::Applied => Ok(()),
        // Someone else already moved the task on; nothing left to roll back.
        CasOutcome::VersionMismatch { .. } | CasOutcome::NotFound => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::{Priority, Project, RegistrationToken};
    use forge_core::queue::memory::MemoryStreamQueue;
    use forge_core::store::memory::InMemoryStore;
    use forge_core::store::ProjectBatch;
    use std::collections::BTreeSet;

    async fn project_with_ready_task(store: &InMemoryStore) -> (Uuid, Uuid) {
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
        let task = Task {
            id: task_id,
            project_id,
            phase_id,
            title: "t".into(),
            description: String::new(),
            priority: Priority::Medium,
            status: TaskState::Ready,
            version: 1,
            depends_on: BTreeSet::new(),
            worker_prompt: serde_json::json!({}),
            qa_prompt: serde_json::json!({}),
            assigned_worker_id: None,
            reviewer_id: None,
            branch_name: Some("feature/t".into()),
            commit_hash: None,
            qa_result: None,
            output_path: None,
            error_message: None,
            assignment_message_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        store
            .create_project_batch(ProjectBatch {
                project,
                phases: vec![],
                tasks: vec![task],
            })
            .await
            .unwrap();

        (project_id, task_id)
    }

    #[tokio::test]
    async fn dispatch_with_no_workers_is_a_silent_noop() {
        let store = InMemoryStore::new();
        let queue = MemoryStreamQueue::new();
        let registry = WorkerRegistry::new(Arc::new(InMemoryStore::new()), 30);
        let (_, task_id) = project_with_ready_task(&store).await;
        let task = store.get_task(task_id).await.unwrap().unwrap();

        dispatch(&store, &queue, &registry, task).await.unwrap();

        let after = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskState::Ready);
    }

    #[tokio::test]
    async fn dispatch_moves_ready_to_queued_and_publishes() {
        let store = Arc::new(InMemoryStore::new());
        let queue = MemoryStreamQueue::new();
        let registry = WorkerRegistry::new(store.clone(), 30);

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
        registry
            .register("tok", "w".into(), "linux".into(), "docker".into(), serde_json::json!({}))
            .await
            .unwrap();

        let (project_id, task_id) = project_with_ready_task(&store).await;
        let task = store.get_task(task_id).await.unwrap().unwrap();

        dispatch(store.as_ref(), &queue, &registry, task).await.unwrap();

        let after = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskState::Queued);
        assert!(after.assignment_message_id.is_some());
        assert!(after.assigned_worker_id.is_some());

        let stream = forge_core::queue::streams::assign(project_id);
        let messages = queue
            .consume(&stream, "workers", "c1", 10, 0)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload["task_id"], task_id.to_string());
    }
}
