//! Publish/subscribe contract.
//!
//! A message published on a topic is copied to every queue bound to that
//! topic. Consumers on the same queue compete: each message goes to one of
//! them. A delivery stays unsettled until the consumer acks it or nacks it;
//! a nack with requeue makes it available again, flagged as redelivered.

mod memory;
mod redis_streams;

pub use memory::InMemoryBroker;
pub use redis_streams::{RedisStreamBroker, RedisStreamConfig};

use async_trait::async_trait;
use clientele_core::ClienteleResult;

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned identifier used to settle the delivery.
    pub tag: String,
    pub body: Vec<u8>,
    /// Set when this message was handed out before and not acked.
    pub redelivered: bool,
}

/// How a consumer settles a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack { requeue: bool },
}

/// A subscription on one queue.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery. `None` once the broker has closed the queue.
    async fn next(&mut self) -> ClienteleResult<Option<Delivery>>;

    async fn ack(&mut self, delivery: &Delivery) -> ClienteleResult<()>;

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> ClienteleResult<()>;

    async fn settle(
        &mut self,
        delivery: &Delivery,
        disposition: Disposition,
    ) -> ClienteleResult<()> {
        match disposition {
            Disposition::Ack => self.ack(delivery).await,
            Disposition::Nack { requeue } => self.nack(delivery, requeue).await,
        }
    }
}

/// Fan-out broker.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Copy `body` to every queue bound to `topic`.
    async fn publish(&self, topic: &str, body: Vec<u8>) -> ClienteleResult<()>;

    /// Bind `queue` to `topic` (declaring it if needed) and consume from it.
    async fn subscribe(&self, topic: &str, queue: &str) -> ClienteleResult<Box<dyn Consumer>>;
}
