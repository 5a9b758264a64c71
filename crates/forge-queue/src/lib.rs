//! `forge-queue` — the Redis Streams adapter for `forge_core::queue::StreamQueue`.
//! `XADD`/`XGROUP CREATE`/`XREADGROUP`/`XACK`/`XPENDING`/`XCLAIM` map
//! directly onto `publish`/`ensure_group`/`consume`/`ack`/`pending`/`claim`.

use async_trait::async_trait;
use forge_core::error::{ForgeError, ForgeResult};
use forge_core::model::StreamMessage;
use forge_core::queue::{GroupStart, PendingEntry, StreamQueue};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Value};

#[cfg(any(test, feature = "test-support"))]
pub use forge_core::queue::memory::MemoryStreamQueue;

impl From<RedisError> for ForgeError {
    fn from(err: RedisError) -> Self {
        ForgeError::QueueUnavailable(err.to_string())
    }
}

/// `StreamQueue` over `redis::aio::ConnectionManager`, which transparently
/// reconnects and pipelines commands — the same connection type the pack
/// reaches for whenever it holds a long-lived Redis handle across tasks.
#[derive(Clone)]
pub struct RedisStreamQueue {
    conn: ConnectionManager,
}

impl RedisStreamQueue {
    pub async fn connect(redis_url: &str) -> ForgeResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ForgeError::QueueUnavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ForgeError::QueueUnavailable(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

/// Parse one `XRANGE`/`XREADGROUP` field-value entry into the JSON payload
/// we always store under the single field `"payload"` (see `publish`).
fn decode_fields(fields: Vec<(String, String)>) -> serde_json::Value {
    fields
        .into_iter()
        .find(|(k, _)| k == "payload")
        .and_then(|(_, v)| serde_json::from_str(&v).ok())
        .unwrap_or(serde_json::Value::Null)
}

#[async_trait]
impl StreamQueue for RedisStreamQueue {
    async fn publish(&self, stream: &str, payload: serde_json::Value) -> ForgeResult<String> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(&payload)
            .map_err(|e| ForgeError::QueueUnavailable(e.to_string()))?;
        let id: String = conn.xadd(stream, "*", &[("payload", body)]).await?;
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: GroupStart) -> ForgeResult<()> {
        let mut conn = self.conn.clone();
        let start_id = match start {
            GroupStart::Beginning => "0",
            GroupStart::New => "$",
        };
        let result: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            // BUSYGROUP: the group already exists — ensure_group is idempotent.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block_ms: u64,
    ) -> ForgeResult<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let mut out = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let fields: Vec<(String, String)> = id
                    .map
                    .into_iter()
                    .filter_map(|(k, v)| match v {
                        Value::BulkString(bytes) => {
                            Some((k, String::from_utf8_lossy(&bytes).into_owned()))
                        }
                        Value::SimpleString(s) => Some((k, s)),
                        _ => None,
                    })
                    .collect();
                out.push(StreamMessage {
                    stream: stream.to_string(),
                    id: id.id,
                    payload: decode_fields(fields),
                    delivery_count: 1,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> ForgeResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> ForgeResult<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(10_000)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| PendingEntry {
                id: entry.id,
                consumer: entry.consumer,
                idle_ms: entry.time_since_delivered,
                delivery_count: entry.times_delivered as u32,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: i64,
        ids: &[String],
    ) -> ForgeResult<Vec<StreamMessage>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamClaimReply = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(new_consumer)
            .arg(min_idle_ms)
            .arg(ids)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|id| {
                let fields: Vec<(String, String)> = id
                    .map
                    .into_iter()
                    .filter_map(|(k, v)| match v {
                        Value::BulkString(bytes) => {
                            Some((k, String::from_utf8_lossy(&bytes).into_owned()))
                        }
                        Value::SimpleString(s) => Some((k, s)),
                        _ => None,
                    })
                    .collect();
                StreamMessage {
                    stream: stream.to_string(),
                    id: id.id,
                    payload: decode_fields(fields),
                    delivery_count: 2,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_fields_recovers_json_payload() {
        let fields = vec![("payload".to_string(), r#"{"task_id":"abc"}"#.to_string())];
        let value = decode_fields(fields);
        assert_eq!(value["task_id"], "abc");
    }

    #[test]
    fn decode_fields_missing_payload_is_null() {
        let value = decode_fields(vec![]);
        assert!(value.is_null());
    }
}
