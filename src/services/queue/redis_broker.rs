use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use super::{Delivery, Envelope, MessageBroker, QueueError};

const TAG_KEY: &str = "image_pipeline:delivery_tag";

/// Move one entry from a processing list to another list, only if it is
/// still there. KEYS[1] = source, KEYS[2] = destination,
/// ARGV[1] = entry to remove, ARGV[2] = entry to push, ARGV[3] = push command.
const MOVE_IF_PRESENT: &str = r#"
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
if removed == 1 then
    redis.call(ARGV[3], KEYS[2], ARGV[2])
end
return removed
"#;

/// Redis-backed broker using the reliable-queue pattern.
///
/// Producers `LPUSH`; consumers `BLMOVE` from the right end of the queue into
/// their own processing list, so a message is never visible to two consumers
/// at once and survives a consumer crash. Dead-letter routing is declared on
/// the client side, since Redis lists have no notion of it.
pub struct RedisBroker {
    client: redis::Client,
    dead_letters: RwLock<HashMap<String, Option<String>>>,
    move_script: Script,
}

impl RedisBroker {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            dead_letters: RwLock::new(HashMap::new()),
            move_script: Script::new(MOVE_IF_PRESENT),
        })
    }

    fn processing_key(queue: &str, consumer: &str) -> String {
        format!("{queue}:processing:{consumer}")
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Dead-letter queue of `queue`, failing if the queue was never declared.
    fn route_of(&self, queue: &str) -> Result<Option<String>, QueueError> {
        let routes = self
            .dead_letters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        routes
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    async fn move_if_present(
        &self,
        conn: &mut MultiplexedConnection,
        from: &str,
        to: &str,
        entry: &str,
        replacement: &str,
        push: &str,
    ) -> Result<bool, QueueError> {
        let removed: i64 = self
            .move_script
            .key(from)
            .key(to)
            .arg(entry)
            .arg(replacement)
            .arg(push)
            .invoke_async(conn)
            .await?;
        Ok(removed == 1)
    }
}

/// Decode a stored entry. Entries pushed by producers that do not wrap their
/// payload are delivered as-is with tag 0.
fn decode(raw: &str) -> Envelope {
    serde_json::from_str(raw).unwrap_or_else(|_| Envelope {
        tag: 0,
        redeliveries: 0,
        body: raw.to_string(),
    })
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn declare_queue(
        &self,
        queue: &str,
        dead_letter: Option<&str>,
    ) -> Result<(), QueueError> {
        let mut routes = self
            .dead_letters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        routes.insert(queue.to_string(), dead_letter.map(str::to_string));
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &str) -> Result<(), QueueError> {
        self.route_of(queue)?;
        let mut conn = self.connection().await?;
        let tag: u64 = conn.incr(TAG_KEY, 1).await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(&Envelope {
            tag,
            redeliveries: 0,
            body: body.to_string(),
        })
        .map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(queue, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        self.route_of(queue)?;
        let processing = Self::processing_key(queue, consumer);
        let mut conn = self.connection().await?;

        // BLMOVE treats a zero timeout as "block forever".
        let raw: Option<String> = if timeout.is_zero() {
            redis::cmd("LMOVE")
                .arg(queue)
                .arg(&processing)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?
        } else {
            redis::cmd("BLMOVE")
                .arg(queue)
                .arg(&processing)
                .arg("RIGHT")
                .arg("LEFT")
                .arg(timeout.as_secs_f64())
                .query_async(&mut conn)
                .await?
        };

        Ok(raw.map(|raw| decode(&raw).into_delivery(queue, consumer, raw)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let processing = Self::processing_key(&delivery.queue, &delivery.consumer);
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .lrem(&processing, 1, delivery.receipt())
            .await
            .map_err(QueueError::Redis)?;
        if removed == 0 {
            return Err(QueueError::UnknownDelivery { tag: delivery.tag });
        }
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<Option<String>, QueueError> {
        let route = self.route_of(&delivery.queue)?;
        let processing = Self::processing_key(&delivery.queue, &delivery.consumer);
        let mut conn = self.connection().await?;

        let Some(dlq) = route else {
            let removed: i64 = conn
                .lrem(&processing, 1, delivery.receipt())
                .await
                .map_err(QueueError::Redis)?;
            if removed == 0 {
                return Err(QueueError::UnknownDelivery { tag: delivery.tag });
            }
            return Ok(None);
        };

        let receipt = delivery.receipt();
        if !self
            .move_if_present(&mut conn, &processing, &dlq, receipt, receipt, "LPUSH")
            .await?
        {
            return Err(QueueError::UnknownDelivery { tag: delivery.tag });
        }
        Ok(Some(dlq))
    }

    async fn forward(&self, delivery: &Delivery, queue: &str) -> Result<(), QueueError> {
        self.route_of(&delivery.queue)?;
        self.route_of(queue)?;
        let processing = Self::processing_key(&delivery.queue, &delivery.consumer);
        let mut conn = self.connection().await?;
        let receipt = delivery.receipt();
        if !self
            .move_if_present(&mut conn, &processing, queue, receipt, receipt, "LPUSH")
            .await?
        {
            return Err(QueueError::UnknownDelivery { tag: delivery.tag });
        }
        Ok(())
    }

    async fn recover(&self, queue: &str, consumer: &str) -> Result<u64, QueueError> {
        let processing = Self::processing_key(queue, consumer);
        let mut conn = self.connection().await?;
        // Newest entries sit at the left; pushing them to the consuming end
        // first leaves the oldest one to be delivered next.
        let held: Vec<String> = conn
            .lrange(&processing, 0, -1)
            .await
            .map_err(QueueError::Redis)?;

        let mut moved = 0;
        for raw in held {
            let mut envelope = decode(&raw);
            envelope.redeliveries += 1;
            let replacement = serde_json::to_string(&envelope).map_err(QueueError::Serialize)?;
            if self
                .move_if_present(&mut conn, &processing, queue, &raw, &replacement, "RPUSH")
                .await?
            {
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(queue).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    /// Check Redis connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}
