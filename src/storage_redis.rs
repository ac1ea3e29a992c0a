#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::AsyncCommands;

#[cfg(feature = "redis")]
use crate::channel::{Envelope, MessageChannel, Queue};
#[cfg(feature = "redis")]
use crate::error::{ChannelError, StoreError};
#[cfg(feature = "redis")]
use crate::rate_limit::CounterStore;
#[cfg(feature = "redis")]
use crate::types::DeliveryMessage;

/// Increments the counter and gives it a TTL in one atomic step. A key
/// found without a TTL (left by an older writer) is repaired on the spot.
#[cfg(feature = "redis")]
const INCREMENT_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
if redis.call('TTL', KEYS[1]) < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Rate-limit counters in Redis.
#[cfg(feature = "redis")]
pub struct RedisCounterStore {
    client: redis::Client,
    script: redis::Script,
}

#[cfg(feature = "redis")]
impl RedisCounterStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            script: redis::Script::new(INCREMENT_WITH_EXPIRY),
        }
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let mut conn = self
            .client
            .get_tokio_connection()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        self.script
            .key(key)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

/// Durable channel over Redis lists.
///
/// `receive` moves a message atomically from the queue list into a
/// per-queue processing list; `ack` removes it from there. Messages left in
/// a processing list by a crashed worker are put back with
/// [`RedisChannel::requeue_unacked`].
#[cfg(feature = "redis")]
pub struct RedisChannel {
    client: redis::Client,
    prefix: String,
    poll_timeout_secs: u64,
}

#[cfg(feature = "redis")]
impl RedisChannel {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            poll_timeout_secs: 1,
        }
    }

    fn queue_key(&self, queue: Queue) -> String {
        format!("{}:{}", self.prefix, queue.name())
    }

    fn processing_key(&self, queue: Queue) -> String {
        format!("{}:{}:processing", self.prefix, queue.name())
    }

    async fn connection(&self) -> Result<redis::aio::Connection, ChannelError> {
        self.client
            .get_tokio_connection()
            .await
            .map_err(|e| ChannelError::Backend(e.to_string()))
    }

    /// Move every unacknowledged message of `queue` back onto the queue.
    /// Call once at startup, before any worker consumes.
    pub async fn requeue_unacked(&self, queue: Queue) -> Result<usize, ChannelError> {
        let mut conn = self.connection().await?;
        let mut moved = 0usize;
        loop {
            let raw: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(self.processing_key(queue))
                .arg(self.queue_key(queue))
                .query_async(&mut conn)
                .await
                .map_err(|e| ChannelError::Backend(e.to_string()))?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl MessageChannel for RedisChannel {
    async fn publish(&self, queue: Queue, message: &DeliveryMessage) -> Result<(), ChannelError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.connection().await?;
        let _: () = conn
            .lpush(self.queue_key(queue), payload)
            .await
            .map_err(|e| ChannelError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn receive(&self, queue: Queue) -> Result<Option<Envelope>, ChannelError> {
        let mut conn = self.connection().await?;
        loop {
            let raw: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(self.queue_key(queue))
                .arg(self.processing_key(queue))
                .arg(self.poll_timeout_secs)
                .query_async(&mut conn)
                .await
                .map_err(|e| ChannelError::Backend(e.to_string()))?;

            let Some(raw) = raw else { continue };

            match serde_json::from_str::<DeliveryMessage>(&raw) {
                Ok(message) => {
                    return Ok(Some(Envelope {
                        queue,
                        message,
                        receipt: raw,
                    }));
                }
                Err(e) => {
                    tracing::error!(
                        target: "webhook_delivery",
                        queue = %queue,
                        error = %e,
                        "Discarding undecodable message"
                    );
                    let _: Result<i64, _> = conn.lrem(self.processing_key(queue), 1, raw).await;
                }
            }
        }
    }

    async fn ack(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn
            .lrem(self.processing_key(envelope.queue), 1, &envelope.receipt)
            .await
            .map_err(|e| ChannelError::Backend(e.to_string()))?;
        Ok(())
    }
}
