//! The Worker Registry (C4) — registration, heartbeat, liveness, and
//! capability-matched assignment routing, over a `Store` handle. Workers
//! are persisted entities: a registry restart must not forget them, so
//! this wraps `Store` rather than keeping its own table.

use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use forge_core::error::{ForgeError, ForgeResult};
use forge_core::model::{TaskState, Worker, WorkerStatus};
use forge_core::store::Store;

fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// What a `heartbeat` response tells the worker to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatDirective {
    /// Nothing unusual; keep working.
    Continue,
    /// The worker's current task was cancelled out from under it; the
    /// heartbeat response tells it to finish up and exit.
    Drain,
}

/// The result of a successful `heartbeat` call.
#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    pub status: WorkerStatus,
    pub pending_tasks: u32,
    pub current_task_id: Option<Uuid>,
    pub directive: HeartbeatDirective,
}

/// `WorkerRegistry` — register/heartbeat/find-idle over a `Store` handle.
pub struct WorkerRegistry<S: Store> {
    store: Arc<S>,
    heartbeat_interval_secs: i64,
}

impl<S: Store> WorkerRegistry<S> {
    pub fn new(store: Arc<S>, heartbeat_interval_secs: i64) -> Self {
        Self {
            store,
            heartbeat_interval_secs,
        }
    }

    /// Validate and consume a registration token, create the worker, and
    /// return `(worker_id, worker_secret)`. The secret is returned to the
    /// caller exactly once; only its hash is persisted.
    pub async fn register(
        &self,
        token: &str,
        display_name: String,
        platform: String,
        executor: String,
        capabilities: serde_json::Value,
    ) -> ForgeResult<(Uuid, String)> {
        let record = self
            .store
            .get_registration_token(token)
            .await?
            .ok_or(ForgeError::TokenNotFound)?;

        let now = Utc::now();
        if record.revoked {
            return Err(ForgeError::TokenRevoked);
        }
        if record.consumed_by.is_some() {
            return Err(ForgeError::TokenAlreadyUsed);
        }
        if !record.is_usable(now) {
            return Err(ForgeError::TokenExpired);
        }

        let worker_id = Uuid::new_v4();
        // Atomically mark the token consumed first: if a concurrent caller
        // races us, only one `consume_registration_token` succeeds.
        if !self.store.consume_registration_token(token, worker_id).await? {
            return Err(ForgeError::TokenAlreadyUsed);
        }

        let secret = generate_secret();
        let worker = Worker {
            id: worker_id,
            display_name,
            platform,
            executor,
            capabilities,
            secret_hash: hash_secret(&secret),
            registered_at: now,
            last_heartbeat: now,
            current_task_id: None,
        };
        self.store.upsert_worker(worker).await?;

        Ok((worker_id, secret))
    }

    async fn authenticate(&self, worker_id: Uuid, secret: &str) -> ForgeResult<Worker> {
        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or(ForgeError::InvalidWorkerCredentials { worker_id })?;
        if worker.secret_hash != hash_secret(secret) {
            return Err(ForgeError::InvalidWorkerCredentials { worker_id });
        }
        Ok(worker)
    }

    /// Verify `(worker_id, worker_secret)` without mutating anything — used
    /// by the Result Ingester to validate message provenance.
    pub async fn verify(&self, worker_id: Uuid, secret: &str) -> ForgeResult<Worker> {
        self.authenticate(worker_id, secret).await
    }

    /// Update `last_heartbeat` and report the worker's pending assignment
    /// count and current task. Heartbeat is the only mechanism by which an
    /// `offline` worker returns to `idle`.
    pub async fn heartbeat(&self, worker_id: Uuid, secret: &str) -> ForgeResult<HeartbeatOutcome> {
        let worker = self.authenticate(worker_id, secret).await?;
        let now = Utc::now();
        self.store.touch_worker_heartbeat(worker_id, now).await?;

        let mut directive = HeartbeatDirective::Continue;
        let mut pending_tasks = 0u32;
        if let Some(task_id) = worker.current_task_id {
            match self.store.get_task(task_id).await? {
                Some(task) if matches!(task.status, TaskState::Queued | TaskState::InProgress) => {
                    pending_tasks = 1;
                }
                _ => {
                    // The task moved on without the worker (admin cancel,
                    // or it was re-claimed elsewhere): tell it to drain.
                    directive = HeartbeatDirective::Drain;
                }
            }
        }

        Ok(HeartbeatOutcome {
            status: worker.derived_status(now, self.heartbeat_interval_secs),
            pending_tasks,
            current_task_id: worker.current_task_id,
            directive,
        })
    }

    /// Find an `idle` worker whose capabilities are a superset of
    /// `required` (an empty requirement matches any worker). Used by the
    /// Dispatcher (C6); returns `None` rather than erroring so the caller
    /// can leave the task in `ready` for the next tick.
    pub async fn find_idle_with_capabilities(
        &self,
        required: &serde_json::Value,
    ) -> ForgeResult<Option<Worker>> {
        let now = Utc::now();
        let workers = self.store.list_workers().await?;
        Ok(workers.into_iter().find(|w| {
            w.derived_status(now, self.heartbeat_interval_secs) == WorkerStatus::Idle
                && capabilities_satisfy(&w.capabilities, required)
        }))
    }

    pub async fn set_current_task(&self, worker_id: Uuid, task_id: Option<Uuid>) -> ForgeResult<()> {
        self.store.set_worker_current_task(worker_id, task_id).await
    }
}

/// `required` matches `declared` iff every key/value pair in `required`
/// (treated as an object) is present with an equal value in `declared`.
/// An empty or non-object `required` matches anything (spec §4.4: "empty
/// required set matches any").
fn capabilities_satisfy(declared: &serde_json::Value, required: &serde_json::Value) -> bool {
    let Some(required) = required.as_object() else {
        return true;
    };
    if required.is_empty() {
        return true;
    }
    let Some(declared) = declared.as_object() else {
        return false;
    };
    required
        .iter()
        .all(|(k, v)| declared.get(k).map(|dv| dv == v).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::RegistrationToken;
    use forge_core::store::memory::InMemoryStore;

    fn registry() -> WorkerRegistry<InMemoryStore> {
        WorkerRegistry::new(Arc::new(InMemoryStore::new()), 30)
    }

    async fn seed_token(store: &InMemoryStore, token: &str) {
        store
            .create_registration_token(RegistrationToken {
                token: token.to_string(),
                display_name: None,
                created_at: Utc::now(),
                expires_at: None,
                revoked: false,
                consumed_by: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn register_then_duplicate_consumption_fails() {
        let store = Arc::new(InMemoryStore::new());
        seed_token(&store, "tok-1").await;
        let registry = WorkerRegistry::new(store, 30);

        let (worker_id, secret) = registry
            .register(
                "tok-1",
                "w1".into(),
                "linux".into(),
                "docker".into(),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert!(registry.verify(worker_id, &secret).await.is_ok());

        let err = registry
            .register(
                "tok-1",
                "w2".into(),
                "linux".into(),
                "docker".into(),
                serde_json::json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::TokenAlreadyUsed));
    }

    #[tokio::test]
    async fn heartbeat_rejects_wrong_secret() {
        let store = Arc::new(InMemoryStore::new());
        seed_token(&store, "tok-2").await;
        let registry = WorkerRegistry::new(store, 30);
        let (worker_id, _secret) = registry
            .register(
                "tok-2",
                "w".into(),
                "linux".into(),
                "docker".into(),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let err = registry.heartbeat(worker_id, "wrong").await.unwrap_err();
        assert!(matches!(err, ForgeError::InvalidWorkerCredentials { .. }));
    }

    #[test]
    fn empty_requirement_matches_any_worker() {
        assert!(capabilities_satisfy(
            &serde_json::json!({}),
            &serde_json::json!({})
        ));
    }

    #[test]
    fn subset_capability_check() {
        let declared = serde_json::json!({"language": "rust", "gpu": true});
        let required = serde_json::json!({"language": "rust"});
        assert!(capabilities_satisfy(&declared, &required));

        let required_missing = serde_json::json!({"language": "python"});
        assert!(!capabilities_satisfy(&declared, &required_missing));
    }

    #[tokio::test]
    async fn idle_worker_found_by_capability() {
        let _ = registry(); // smoke: constructible without a live store
        let store = Arc::new(InMemoryStore::new());
        seed_token(&store, "tok-3").await;
        let registry = WorkerRegistry::new(store, 30);
        let (worker_id, _) = registry
            .register(
                "tok-3",
                "w".into(),
                "linux".into(),
                "docker".into(),
                serde_json::json!({"language": "rust"}),
            )
            .await
            .unwrap();

        let found = registry
            .find_idle_with_capabilities(&serde_json::json!({"language": "rust"}))
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, worker_id);
    }
}
