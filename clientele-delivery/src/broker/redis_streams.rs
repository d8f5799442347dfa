//! Redis Streams broker.
//!
//! A topic is a stream, a queue is a consumer group on that stream, so every
//! group sees every entry (fan-out) while consumers inside a group compete.
//!
//! Unacked entries sit in the group's pending list. A nack with requeue
//! leaves the entry pending and makes this consumer re-read its pending list
//! before taking new entries; a nack without requeue acks it away. Entries
//! abandoned by a dead consumer are claimed once they have been idle for
//! [`RedisStreamConfig::claim_idle`].

use super::{Consumer, Delivery, MessageBroker};
use async_trait::async_trait;
use clientele_core::{ClienteleResult, DeliveryError};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::time::Duration;
use uuid::Uuid;

/// Field holding the payload inside each stream entry.
const BODY_FIELD: &str = "body";

/// Tuning for [`RedisStreamBroker`].
#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    /// Prepended to topic names to form stream keys.
    pub stream_prefix: String,
    /// How long one `XREADGROUP` blocks waiting for new entries.
    pub block: Duration,
    /// Pending entries idle this long are taken over from other consumers.
    pub claim_idle: Duration,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            stream_prefix: String::new(),
            block: Duration::from_secs(5),
            claim_idle: Duration::from_secs(60),
        }
    }
}

/// [`MessageBroker`] over Redis Streams.
#[derive(Clone)]
pub struct RedisStreamBroker {
    client: redis::Client,
    publisher: ConnectionManager,
    config: RedisStreamConfig,
}

impl RedisStreamBroker {
    /// Connect to `url` (`redis://[:password@]host:port`).
    pub async fn connect(url: &str, config: RedisStreamConfig) -> ClienteleResult<Self> {
        let client = redis::Client::open(url).map_err(|e| dial_error(url, e))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| dial_error(url, e))?;
        Ok(Self {
            client,
            publisher,
            config,
        })
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}{}", self.config.stream_prefix, topic)
    }
}

fn dial_error(target: &str, e: redis::RedisError) -> DeliveryError {
    DeliveryError::Dial {
        target: target.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl MessageBroker for RedisStreamBroker {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> ClienteleResult<()> {
        let stream = self.stream_key(topic);
        let mut conn = self.publisher.clone();
        let id: String = conn
            .xadd(&stream, "*", &[(BODY_FIELD, body)])
            .await
            .map_err(|e| DeliveryError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(stream = %stream, entry_id = %id, "Published message");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, queue: &str) -> ClienteleResult<Box<dyn Consumer>> {
        let stream = self.stream_key(topic);
        let subscribe_error = |e: redis::RedisError| DeliveryError::Subscribe {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(subscribe_error)?;

        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(&stream, queue, "$").await;
        match created {
            Ok(()) => tracing::info!(stream = %stream, group = %queue, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(subscribe_error(e).into()),
        }

        Ok(Box::new(RedisStreamConsumer {
            conn,
            stream,
            group: queue.to_string(),
            consumer: format!("{}-{}", queue, Uuid::new_v4()),
            block: self.config.block,
            claim_idle: self.config.claim_idle,
            read_pending: true,
        }))
    }
}

/// One consumer inside a consumer group, on its own connection so that
/// blocking reads do not stall other traffic.
struct RedisStreamConsumer {
    conn: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
    block: Duration,
    claim_idle: Duration,
    read_pending: bool,
}

impl RedisStreamConsumer {
    fn consume_error(&self, e: redis::RedisError) -> DeliveryError {
        DeliveryError::Subscribe {
            queue: self.group.clone(),
            reason: e.to_string(),
        }
    }

    /// Move entries idle for `claim_idle` into this consumer's pending list.
    async fn claim_abandoned(&mut self) -> ClienteleResult<()> {
        let claimed: redis::RedisResult<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(100)
            .query_async(&mut self.conn)
            .await;
        claimed.map_err(|e| self.consume_error(e))?;
        Ok(())
    }

    async fn read(&mut self, id: &str, block: bool) -> ClienteleResult<Option<StreamId>> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);
        if block {
            options = options.block(self.block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream], &[id], &options)
            .await
            .map_err(|e| self.consume_error(e))?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next()))
    }

    fn to_delivery(entry: StreamId, redelivered: bool) -> Delivery {
        // An entry without a body field is handed over empty; the subscriber
        // treats it as undecodable.
        let body = entry.get::<Vec<u8>>(BODY_FIELD).unwrap_or_default();
        Delivery {
            tag: entry.id,
            body,
            redelivered,
        }
    }
}

#[async_trait]
impl Consumer for RedisStreamConsumer {
    async fn next(&mut self) -> ClienteleResult<Option<Delivery>> {
        loop {
            if self.read_pending {
                self.claim_abandoned().await?;
                if let Some(entry) = self.read("0", false).await? {
                    return Ok(Some(Self::to_delivery(entry, true)));
                }
                self.read_pending = false;
            }

            if let Some(entry) = self.read(">", true).await? {
                return Ok(Some(Self::to_delivery(entry, false)));
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> ClienteleResult<()> {
        let acked: i64 = self
            .conn
            .xack(&self.stream, &self.group, &[&delivery.tag])
            .await
            .map_err(|e| DeliveryError::Settle {
                tag: delivery.tag.clone(),
                reason: e.to_string(),
            })?;
        if acked == 0 {
            tracing::warn!(tag = %delivery.tag, "Ack matched no pending entry");
        }
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> ClienteleResult<()> {
        if requeue {
            self.read_pending = true;
            return Ok(());
        }
        tracing::warn!(tag = %delivery.tag, "Message rejected without requeue, dropped");
        self.ack(delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisStreamConfig::default();
        assert_eq!(config.block, Duration::from_secs(5));
        assert!(config.stream_prefix.is_empty());
    }

    #[test]
    fn test_entry_without_body_becomes_empty_delivery() {
        let entry = StreamId {
            id: "1-0".to_string(),
            map: Default::default(),
        };
        let delivery = RedisStreamConsumer::to_delivery(entry, false);
        assert_eq!(delivery.tag, "1-0");
        assert!(delivery.body.is_empty());
    }
}
