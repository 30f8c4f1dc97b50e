//! Broker on Redis Streams.

use std::time::Duration;

use async_trait::async_trait;
use medx_models::{JobId, Lane};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadReply,
};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Delivery, EnqueueOutcome};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};

/// Deletes the key only while it still names the given job.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// One stream per lane, shared by a consumer group.
pub struct RedisBroker {
    client: redis::Client,
    config: QueueConfig,
}

impl RedisBroker {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Turn stream entries into deliveries, acknowledging malformed ones.
    async fn to_deliveries(&self, lane: Lane, entries: Vec<StreamId>) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.map.get("job_id") {
                Some(redis::Value::BulkString(raw)) => deliveries.push(Delivery {
                    message_id: entry.id,
                    lane,
                    job_id: JobId::from_string(String::from_utf8_lossy(raw)),
                }),
                _ => {
                    warn!(lane = %lane, message_id = %entry.id, "Dropping malformed stream entry");
                    let delivery = Delivery {
                        message_id: entry.id,
                        lane,
                        job_id: JobId::from_string(""),
                    };
                    self.ack(&delivery).await.ok();
                }
            }
        }
        deliveries
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn init(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        for lane in Lane::ALL {
            let stream = self.config.stream_name(lane);
            let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&stream)
                .arg(&self.config.consumer_group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match result {
                Ok(()) => info!("Created consumer group {} on {}", self.config.consumer_group, stream),
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!("Consumer group already exists on {}", stream);
                }
                Err(e) => return Err(QueueError::Redis(e)),
            }
        }

        Ok(())
    }

    async fn enqueue(
        &self,
        lane: Lane,
        job_id: &JobId,
        unique_key: &str,
        window: Duration,
    ) -> QueueResult<EnqueueOutcome> {
        let mut conn = self.connection().await?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(unique_key)
            .arg(job_id.as_str())
            .arg("NX")
            .arg("PX")
            .arg(window.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        if acquired.is_none() {
            let holder: Option<String> = conn.get(unique_key).await?;
            if let Some(holder) = holder {
                debug!(job_id = %holder, "Duplicate submission inside uniqueness window");
                return Ok(EnqueueOutcome::Duplicate(JobId::from_string(holder)));
            }
            // Holder expired between SET and GET; the key is free again.
            return self.enqueue(lane, job_id, unique_key, window).await;
        }

        let added: Result<String, redis::RedisError> = redis::cmd("XADD")
            .arg(self.config.stream_name(lane))
            .arg("*")
            .arg("job_id")
            .arg(job_id.as_str())
            .query_async(&mut conn)
            .await;

        match added {
            Ok(message_id) => {
                info!(job_id = %job_id, lane = %lane, message_id = %message_id, "Enqueued job");
                Ok(EnqueueOutcome::Enqueued { message_id })
            }
            Err(e) => {
                self.release_unique(unique_key, job_id).await.ok();
                Err(QueueError::enqueue_failed(e.to_string()))
            }
        }
    }

    async fn dequeue(
        &self,
        lane: Lane,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1));
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(self.config.stream_name(lane)).arg(">");

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::dequeue_failed(e.to_string()))?;

        let entries: Vec<StreamId> = reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default();
        Ok(self.to_deliveries(lane, entries).await)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let stream = self.config.stream_name(delivery.lane);

        redis::cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(&delivery.message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&stream)
            .arg(&delivery.message_id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!(message_id = %delivery.message_id, "Acknowledged delivery");
        Ok(())
    }

    async fn claim_stale(
        &self,
        lane: Lane,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;
        let stream = self.config.stream_name(lane);

        let pending: StreamPendingReply = redis::cmd("XPENDING")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .query_async(&mut conn)
            .await?;
        if pending.count() == 0 {
            return Ok(Vec::new());
        }

        let detail: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;
        let ids: Vec<String> = detail.ids.into_iter().map(|pending| pending.id).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let deliveries = self.to_deliveries(lane, claimed.ids).await;
        if !deliveries.is_empty() {
            info!(lane = %lane, count = deliveries.len(), "Claimed stale deliveries");
        }
        Ok(deliveries)
    }

    async fn release_unique(&self, unique_key: &str, job_id: &JobId) -> QueueResult<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(unique_key)
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn len(&self, lane: Lane) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.xlen(self.config.stream_name(lane)).await?;
        Ok(len)
    }

    fn name(&self) -> &str {
        "redis"
    }
}
