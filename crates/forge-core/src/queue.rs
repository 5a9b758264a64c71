//! The Stream Queue port (C2) — durable publish/consume/acknowledge over a
//! named log with consumer-group semantics.

use async_trait::async_trait;

use crate::error::ForgeResult;
use crate::model::StreamMessage;

/// Where a newly-created consumer group should start reading from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Replay the entire stream history.
    Beginning,
    /// Only messages published after the group is created.
    New,
}

/// One pending (delivered, not yet acknowledged) message.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: i64,
    pub delivery_count: u32,
}

/// The Stream Queue port. Implementations must preserve ordering within a
/// stream and deliver at-least-once within a group.
#[async_trait]
pub trait StreamQueue: Send + Sync {
    async fn publish(&self, stream: &str, payload: serde_json::Value) -> ForgeResult<String>;

    /// Idempotent consumer-group creation.
    async fn ensure_group(&self, stream: &str, group: &str, start: GroupStart) -> ForgeResult<()>;

    /// Read messages not yet delivered to `group`, assigning them to
    /// `consumer`'s pending list.
    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block_ms: u64,
    ) -> ForgeResult<Vec<StreamMessage>>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> ForgeResult<()>;

    async fn pending(&self, stream: &str, group: &str) -> ForgeResult<Vec<PendingEntry>>;

    /// Reassign messages whose owner appears dead (idle past `min_idle_ms`)
    /// to `new_consumer`.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: i64,
        ids: &[String],
    ) -> ForgeResult<Vec<StreamMessage>>;
}

/// Core channel names.
pub mod streams {
    pub fn assign(project_id: uuid::Uuid) -> String {
        format!("tasks:assign:{project_id}")
    }
    pub const RESULTS: &str = "tasks:results";
    pub const DLQ: &str = "tasks:dlq";
    pub fn control(worker_id: uuid::Uuid) -> String {
        format!("workers:control:{worker_id}")
    }
}

pub mod groups {
    pub const WORKERS: &str = "workers";
    pub const INGESTERS: &str = "ingesters";
}

#[cfg(any(test, feature = "test-support"))]
pub mod memory {
    //! In-memory `StreamQueue` for tests: a `Vec` per stream plus a pending
    //! map per (stream, group).

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    struct Entry {
        id: String,
        payload: serde_json::Value,
    }

    struct PendingItem {
        id: String,
        consumer: String,
        delivered_at: std::time::Instant,
        delivery_count: u32,
    }

    #[derive(Default)]
    struct Inner {
        streams: HashMap<String, Vec<Entry>>,
        cursors: HashMap<(String, String), usize>,
        pending: HashMap<(String, String), Vec<PendingItem>>,
        seq: u64,
    }

    /// In-memory `StreamQueue`, gated behind the `test-support` feature.
    #[derive(Default)]
    pub struct MemoryStreamQueue(Mutex<Inner>);

    impl MemoryStreamQueue {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl StreamQueue for MemoryStreamQueue {
        async fn publish(&self, stream: &str, payload: serde_json::Value) -> ForgeResult<String> {
            let mut inner = self.0.lock().unwrap();
            inner.seq += 1;
            let id = format!("{}-0", inner.seq);
            inner
                .streams
                .entry(stream.to_string())
                .or_default()
                .push(Entry {
                    id: id.clone(),
                    payload,
                });
            Ok(id)
        }

        async fn ensure_group(
            &self,
            stream: &str,
            group: &str,
            start: GroupStart,
        ) -> ForgeResult<()> {
            let mut inner = self.0.lock().unwrap();
            let key = (stream.to_string(), group.to_string());
            let len = inner.streams.get(stream).map(|s| s.len()).unwrap_or(0);
            inner.cursors.entry(key).or_insert(match start {
                GroupStart::Beginning => 0,
                GroupStart::New => len,
            });
            Ok(())
        }

        async fn consume(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            max: usize,
            _block_ms: u64,
        ) -> ForgeResult<Vec<StreamMessage>> {
            let mut inner = self.0.lock().unwrap();
            let key = (stream.to_string(), group.to_string());
            let cursor = *inner.cursors.get(&key).unwrap_or(&0);
            let entries: Vec<(String, serde_json::Value)> = inner
                .streams
                .get(stream)
                .map(|s| {
                    s.iter()
                        .skip(cursor)
                        .take(max)
                        .map(|e| (e.id.clone(), e.payload.clone()))
                        .collect()
                })
                .unwrap_or_default();

            let advanced = cursor + entries.len();
            inner.cursors.insert(key.clone(), advanced);

            let pending = inner.pending.entry(key).or_default();
            let mut out = Vec::with_capacity(entries.len());
            for (id, payload) in entries {
                pending.push(PendingItem {
                    id: id.clone(),
                    consumer: consumer.to_string(),
                    delivered_at: std::time::Instant::now(),
                    delivery_count: 1,
                });
                out.push(StreamMessage {
                    stream: stream.to_string(),
                    id,
                    payload,
                    delivery_count: 1,
                });
            }
            Ok(out)
        }

        async fn ack(&self, stream: &str, group: &str, id: &str) -> ForgeResult<()> {
            let mut inner = self.0.lock().unwrap();
            let key = (stream.to_string(), group.to_string());
            if let Some(p) = inner.pending.get_mut(&key) {
                p.retain(|item| item.id != id);
            }
            Ok(())
        }

        async fn pending(&self, stream: &str, group: &str) -> ForgeResult<Vec<PendingEntry>> {
            let inner = self.0.lock().unwrap();
            let key = (stream.to_string(), group.to_string());
            Ok(inner
                .pending
                .get(&key)
                .map(|p| {
                    p.iter()
                        .map(|item| PendingEntry {
                            id: item.id.clone(),
                            consumer: item.consumer.clone(),
                            idle_ms: item.delivered_at.elapsed().as_millis() as i64,
                            delivery_count: item.delivery_count,
                        })
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn claim(
            &self,
            stream: &str,
            group: &str,
            new_consumer: &str,
            min_idle_ms: i64,
            ids: &[String],
        ) -> ForgeResult<Vec<StreamMessage>> {
            let mut inner = self.0.lock().unwrap();
            let key = (stream.to_string(), group.to_string());
            let mut claimed = Vec::new();
            if let Some(pending) = inner.pending.get_mut(&key) {
                for item in pending.iter_mut() {
                    if ids.contains(&item.id)
                        && item.delivered_at.elapsed().as_millis() as i64 >= min_idle_ms
                    {
                        item.consumer = new_consumer.to_string();
                        item.delivered_at = std::time::Instant::now();
                        item.delivery_count += 1;
                        claimed.push(item.id.clone());
                    }
                }
            }
            let payloads = inner
                .streams
                .get(stream)
                .map(|s| {
                    s.iter()
                        .filter(|e| claimed.contains(&e.id))
                        .map(|e| StreamMessage {
                            stream: stream.to_string(),
                            id: e.id.clone(),
                            payload: e.payload.clone(),
                            delivery_count: 2,
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(payloads)
        }
    }
}
