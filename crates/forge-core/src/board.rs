//! The Board Event Bus (C8) — process-local pub/sub keyed by project id.
//! Every committed state transition is published here; the (out-of-scope)
//! WebSocket layer is the consumer. Publishing is non-blocking: a lagging
//! subscriber drops its oldest buffered events rather than stall the
//! publisher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Bounded per-subscriber buffer; overflow drops the oldest event first
/// (broadcast's native lagged-receiver semantics).
const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BoardEvent {
    TaskMoved {
        task_id: Uuid,
        from: String,
        to: String,
        ts: DateTime<Utc>,
    },
    TaskUpdated {
        task_id: Uuid,
        ts: DateTime<Utc>,
    },
    WorkerAssigned {
        task_id: Uuid,
        worker_id: Uuid,
        ts: DateTime<Utc>,
    },
    Refresh {
        ts: DateTime<Utc>,
    },
}

/// A live subscription to one project's board events.
pub struct BoardSubscription {
    pub project_id: Uuid,
    receiver: broadcast::Receiver<BoardEvent>,
}

impl BoardSubscription {
    pub async fn recv(&mut self) -> Option<BoardEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Process-local, per-project publish/subscribe hub.
#[derive(Clone, Default)]
pub struct BoardBus {
    channels: Arc<DashMap<Uuid, broadcast::Sender<BoardEvent>>>,
}

impl BoardBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, project_id: Uuid) -> broadcast::Sender<BoardEvent> {
        self.channels
            .entry(project_id)
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CAPACITY).0)
            .clone()
    }

    /// Publish an event for `project_id`. Never blocks; if there are no
    /// subscribers the event is simply dropped.
    pub fn publish(&self, project_id: Uuid, event: BoardEvent) {
        let _ = self.sender(project_id).send(event);
    }

    pub fn subscribe(&self, project_id: Uuid) -> BoardSubscription {
        BoardSubscription {
            project_id,
            receiver: self.sender(project_id).subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_is_delivered() {
        let bus = BoardBus::new();
        let project_id = Uuid::new_v4();
        let mut sub = bus.subscribe(project_id);
        bus.publish(
            project_id,
            BoardEvent::Refresh { ts: Utc::now() },
        );
        assert!(sub.recv().await.is_some());
    }

    #[tokio::test]
    async fn publish_without_subscriber_does_not_block() {
        let bus = BoardBus::new();
        bus.publish(Uuid::new_v4(), BoardEvent::Refresh { ts: Utc::now() });
    }
}
