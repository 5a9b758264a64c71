use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered worker process.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub id: Uuid,
    pub display_name: String,
    pub platform: String,
    pub executor: String,
    /// Opaque capability bag; the dispatcher treats `required_capabilities`
    /// as a subset check against this.
    #[serde(default)]
    pub capabilities: serde_json::Value,
    /// Hash of the worker secret issued at registration; never serialized
    /// back out to callers.
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<Uuid>,
}

/// Derived (never persisted) liveness/availability classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

impl Worker {
    /// `offline` iff the heartbeat is stale by more than twice the
    /// configured interval, regardless of `current_task_id` — a crashed
    /// worker's in-flight task stays `in_progress` (spec §8 boundary
    /// behavior, scenario 4), but the worker itself must still read as
    /// `offline`. Otherwise `busy` iff assigned a task, else `idle`.
    pub fn derived_status(&self, now: DateTime<Utc>, heartbeat_interval_secs: i64) -> WorkerStatus {
        let stale_after = chrono::Duration::seconds(heartbeat_interval_secs * 2);
        if now - self.last_heartbeat > stale_after {
            return WorkerStatus::Offline;
        }
        if self.current_task_id.is_some() {
            return WorkerStatus::Busy;
        }
        WorkerStatus::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_at(last_heartbeat: DateTime<Utc>) -> Worker {
        Worker {
            id: Uuid::new_v4(),
            display_name: "w".into(),
            platform: "linux".into(),
            executor: "docker".into(),
            capabilities: serde_json::json!({}),
            secret_hash: "x".into(),
            registered_at: last_heartbeat,
            last_heartbeat,
            current_task_id: None,
        }
    }

    #[test]
    fn offline_after_two_intervals() {
        let now = Utc::now();
        let w = worker_at(now - chrono::Duration::seconds(61));
        assert_eq!(w.derived_status(now, 30), WorkerStatus::Offline);
    }

    #[test]
    fn idle_within_window() {
        let now = Utc::now();
        let w = worker_at(now - chrono::Duration::seconds(10));
        assert_eq!(w.derived_status(now, 30), WorkerStatus::Idle);
    }

    #[test]
    fn busy_within_window() {
        let now = Utc::now();
        let mut w = worker_at(now - chrono::Duration::seconds(10));
        w.current_task_id = Some(Uuid::new_v4());
        assert_eq!(w.derived_status(now, 30), WorkerStatus::Busy);
    }

    #[test]
    fn staleness_overrides_busy() {
        let now = Utc::now();
        let mut w = worker_at(now - chrono::Duration::seconds(1000));
        w.current_task_id = Some(Uuid::new_v4());
        assert_eq!(w.derived_status(now, 30), WorkerStatus::Offline);
    }
}
