//! The Task State Machine (C3) — pure validation and mutation-planning
//! logic. Nothing in this module performs I/O; callers (the Postgres store,
//! the orchestrator) apply the returned `TaskMutation` atomically via
//! `Store::compare_and_set_task`.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{ForgeError, ForgeResult};
use crate::model::{Actor, Task, TaskState, TransitionRecord};

/// A snapshot of a dependency's current status, as seen by the caller
/// requesting a transition.
#[derive(Debug, Clone, Copy)]
pub struct DepStatus {
    pub task_id: Uuid,
    pub status: TaskState,
}

/// The planned effect of a validated transition: the task's mutated fields
/// plus the audit record to append. The caller commits both atomically.
#[derive(Debug, Clone)]
pub struct TaskMutation {
    pub task: Task,
    pub record: TransitionRecord,
}

/// Validate and plan a transition for `task` to `to`, given the live status
/// of its dependencies. Does not write anything.
///
/// Validation order follows the transition contract exactly:
/// 1. `(from, to)` is in the legal-transitions set.
/// 2. `expected_version` equals the task's current version.
/// 3. state-specific preconditions hold.
pub fn propose_transition(
    task: &Task,
    to: TaskState,
    actor: Actor,
    reason: Option<String>,
    expected_version: i64,
    dep_statuses: &[DepStatus],
) -> ForgeResult<TaskMutation> {
    let from = task.status;

    if !from.can_transition_to(to) {
        return Err(ForgeError::IllegalTransition {
            task_id: task.id,
            from,
            to,
        });
    }

    if task.version != expected_version {
        return Err(ForgeError::VersionConflict {
            task_id: task.id,
            expected: expected_version,
            current: task.version,
        });
    }

    if to == TaskState::Ready {
        let unmet: Vec<Uuid> = task
            .depends_on
            .iter()
            .copied()
            .filter(|dep_id| {
                !dep_statuses
                    .iter()
                    .any(|d| d.task_id == *dep_id && d.status == TaskState::Done)
            })
            .collect();
        if !unmet.is_empty() {
            return Err(ForgeError::DependencyNotSatisfied {
                task_id: task.id,
                unmet,
            });
        }
    }

    if to == TaskState::Queued && task.assignment_message_id.is_none() {
        return Err(ForgeError::MissingPrerequisite {
            task_id: task.id,
            to,
            detail: "entering queued requires an assigned stream message id".into(),
        });
    }

    if to == TaskState::InProgress && task.assigned_worker_id.is_none() {
        return Err(ForgeError::MissingPrerequisite {
            task_id: task.id,
            to,
            detail: "entering in_progress requires an assigned worker id".into(),
        });
    }

    if to == TaskState::Review {
        let has_result = task.output_path.is_some() || task.commit_hash.is_some();
        if !has_result {
            return Err(ForgeError::MissingPrerequisite {
                task_id: task.id,
                to,
                detail: "entering review requires a non-empty result payload".into(),
            });
        }
    }

    if to == TaskState::Done {
        let accepted = task
            .qa_result
            .as_ref()
            .and_then(|v| v.get("accepted"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !accepted {
            return Err(ForgeError::MissingPrerequisite {
                task_id: task.id,
                to,
                detail: "entering done requires a QA-accept result".into(),
            });
        }
    }

    let now = Utc::now();
    let mut next = task.clone();
    next.status = to;
    next.version = task.version + 1;
    next.updated_at = now;

    match to {
        TaskState::InProgress if task.started_at.is_none() => {
            next.started_at = Some(now);
        }
        TaskState::Done => {
            next.completed_at = Some(now);
            next.assigned_worker_id = None;
        }
        TaskState::Rejected => {
            next.assigned_worker_id = None;
        }
        _ => {}
    }

    let record = TransitionRecord {
        id: Uuid::new_v4(),
        task_id: task.id,
        from,
        to,
        actor,
        reason,
        at: now,
        stream_message_id: next.assignment_message_id.clone(),
    };

    Ok(TaskMutation { task: next, record })
}

/// Given the full set of a project's tasks, return the ids that should
/// transition `waiting -> ready` now that `completed_task_id` has become
/// `done`: those whose dependency set is a subset of the done-task set
/// Only `waiting` tasks are candidates; tasks already `ready` or beyond are left alone.
pub fn newly_ready_after_done<'a>(
    tasks: impl Iterator<Item = &'a Task>,
    done_ids: &std::collections::HashSet<Uuid>,
) -> Vec<Uuid> {
    tasks
        .filter(|t| t.status == TaskState::Waiting)
        .filter(|t| t.depends_on.iter().all(|d| done_ids.contains(d)))
        .map(|t| t.id)
        .collect()
}

/// Sort a batch of `ready` tasks by the tie-break order: `(priority desc,
/// created_at asc, id asc)`.
pub fn sort_ready_tasks(tasks: &mut [Task]) {
    tasks.sort_by_key(|t| t.ready_order_key());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use std::collections::{BTreeSet, HashSet};

    fn base_task(status: TaskState) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            phase_id: Uuid::new_v4(),
            title: "t".into(),
            description: String::new(),
            priority: Priority::Medium,
            status,
            version: 1,
            depends_on: BTreeSet::new(),
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
    fn illegal_transition_rejected() {
        let task = base_task(TaskState::Waiting);
        let err = propose_transition(&task, TaskState::Done, Actor::Pm, None, 1, &[]).unwrap_err();
        assert!(matches!(err, ForgeError::IllegalTransition { .. }));
    }

    #[test]
    fn version_conflict_rejected() {
        let task = base_task(TaskState::Ready);
        let err =
            propose_transition(&task, TaskState::Queued, Actor::Pm, None, 99, &[]).unwrap_err();
        assert!(matches!(err, ForgeError::VersionConflict { .. }));
    }

    #[test]
    fn ready_requires_deps_done() {
        let mut task = base_task(TaskState::Waiting);
        let dep = Uuid::new_v4();
        task.depends_on.insert(dep);
        let err = propose_transition(&task, TaskState::Ready, Actor::System, None, 1, &[])
            .unwrap_err();
        assert!(matches!(err, ForgeError::DependencyNotSatisfied { .. }));

        let statuses = [DepStatus {
            task_id: dep,
            status: TaskState::Done,
        }];
        let mutation =
            propose_transition(&task, TaskState::Ready, Actor::System, None, 1, &statuses)
                .unwrap();
        assert_eq!(mutation.task.status, TaskState::Ready);
        assert_eq!(mutation.task.version, 2);
    }

    #[test]
    fn queued_requires_message_id() {
        let task = base_task(TaskState::Ready);
        let err =
            propose_transition(&task, TaskState::Queued, Actor::Pm, None, 1, &[]).unwrap_err();
        assert!(matches!(err, ForgeError::MissingPrerequisite { .. }));

        let mut task = task;
        task.assignment_message_id = Some("1-0".into());
        let mutation =
            propose_transition(&task, TaskState::Queued, Actor::Pm, None, 1, &[]).unwrap();
        assert_eq!(mutation.task.status, TaskState::Queued);
    }

    #[test]
    fn done_requires_terminal_invariant() {
        let mut task = base_task(TaskState::Review);
        task.output_path = Some("out".into());
        task.qa_result = Some(serde_json::json!({"accepted": true}));
        let mutation =
            propose_transition(&task, TaskState::Done, Actor::System, None, 1, &[]).unwrap();
        assert!(mutation.task.is_terminal());
        assert!(mutation.task.completed_at.is_some());
        assert!(mutation.task.assigned_worker_id.is_none());
    }

    #[test]
    fn fan_out_ready_propagation() {
        let a = Uuid::new_v4();
        let b = base_task(TaskState::Waiting);
        let mut c = base_task(TaskState::Waiting);
        c.depends_on.insert(a);
        let mut done: HashSet<Uuid> = HashSet::new();
        done.insert(a);

        let tasks = vec![b.clone(), c.clone()];
        let ready = newly_ready_after_done(tasks.iter(), &done);
        assert!(ready.contains(&c.id));
        assert!(!ready.contains(&b.id));
    }

    #[test]
    fn tie_break_order() {
        let mut low = base_task(TaskState::Ready);
        low.priority = Priority::Low;
        let mut high = base_task(TaskState::Ready);
        high.priority = Priority::High;
        high.created_at = low.created_at + chrono::Duration::seconds(1);

        let mut tasks = vec![low.clone(), high.clone()];
        sort_ready_tasks(&mut tasks);
        assert_eq!(tasks[0].id, high.id);
        assert_eq!(tasks[1].id, low.id);
    }
}
