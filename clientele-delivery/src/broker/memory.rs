//! Process-local fan-out broker.
//!
//! Topics fan out to bound queues; each queue is a FIFO shared by competing
//! consumers. Unsettled deliveries are tracked per consumer and go back to
//! the front of the queue on requeue or when the consumer is dropped.

use super::{Consumer, Delivery, MessageBroker};
use async_trait::async_trait;
use clientele_core::{ClienteleResult, DeliveryError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Message {
    tag: String,
    body: Vec<u8>,
    redelivered: bool,
}

impl Message {
    fn to_delivery(&self) -> Delivery {
        Delivery {
            tag: self.tag.clone(),
            body: self.body.clone(),
            redelivered: self.redelivered,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn push_back(&self, message: Message) -> ClienteleResult<()> {
        let mut state = self.state.lock().map_err(|_| DeliveryError::LockPoisoned)?;
        state.ready.push_back(message);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    fn requeue(&self, mut message: Message) {
        message.redelivered = true;
        if let Ok(mut state) = self.state.lock() {
            state.ready.push_front(message);
        }
        self.notify.notify_one();
    }
}

#[derive(Debug, Default)]
struct BrokerInner {
    /// topic -> names of bound queues
    bindings: Mutex<HashMap<String, Vec<String>>>,
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    next_tag: AtomicU64,
}

/// In-memory [`MessageBroker`]. Clones share the same topics and queues.
///
/// Messages published to a topic with no bound queue are dropped.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn declare_queue(&self, name: &str) -> ClienteleResult<Arc<Queue>> {
        let mut queues = self
            .inner
            .queues
            .lock()
            .map_err(|_| DeliveryError::LockPoisoned)?;
        Ok(Arc::clone(queues.entry(name.to_string()).or_default()))
    }

    /// Messages waiting in `queue` (not counting ones handed to consumers).
    pub fn ready_count(&self, queue: &str) -> usize {
        let queues = match self.inner.queues.lock() {
            Ok(queues) => queues,
            Err(_) => return 0,
        };
        queues
            .get(queue)
            .and_then(|q| q.state.lock().ok().map(|s| s.ready.len()))
            .unwrap_or(0)
    }

    /// Close every queue. Consumers drain what is ready, then `next` yields `None`.
    pub fn close(&self) {
        if let Ok(queues) = self.inner.queues.lock() {
            for queue in queues.values() {
                if let Ok(mut state) = queue.state.lock() {
                    state.closed = true;
                }
                queue.notify.notify_waiters();
            }
        }
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> ClienteleResult<()> {
        let bound: Vec<String> = {
            let bindings = self
                .inner
                .bindings
                .lock()
                .map_err(|_| DeliveryError::LockPoisoned)?;
            bindings.get(topic).cloned().unwrap_or_default()
        };

        if bound.is_empty() {
            tracing::debug!(topic = %topic, "No queue bound, message dropped");
            return Ok(());
        }

        for queue_name in &bound {
            let queue = self.declare_queue(queue_name)?;
            let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
            queue.push_back(Message {
                tag: tag.to_string(),
                body: body.clone(),
                redelivered: false,
            })?;
        }
        tracing::debug!(topic = %topic, queues = bound.len(), "Published message");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, queue: &str) -> ClienteleResult<Box<dyn Consumer>> {
        {
            let mut bindings = self
                .inner
                .bindings
                .lock()
                .map_err(|_| DeliveryError::LockPoisoned)?;
            let bound = bindings.entry(topic.to_string()).or_default();
            if !bound.iter().any(|q| q == queue) {
                bound.push(queue.to_string());
            }
        }

        let queue = self.declare_queue(queue)?;
        Ok(Box::new(InMemoryConsumer {
            queue,
            unsettled: HashMap::new(),
        }))
    }
}

/// Consumer handed out by [`InMemoryBroker::subscribe`].
struct InMemoryConsumer {
    queue: Arc<Queue>,
    unsettled: HashMap<String, Message>,
}

impl InMemoryConsumer {
    fn settle(&mut self, delivery: &Delivery) -> ClienteleResult<Message> {
        self.unsettled.remove(&delivery.tag).ok_or_else(|| {
            DeliveryError::Settle {
                tag: delivery.tag.clone(),
                reason: "unknown or already settled delivery".to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn next(&mut self) -> ClienteleResult<Option<Delivery>> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self
                    .queue
                    .state
                    .lock()
                    .map_err(|_| DeliveryError::LockPoisoned)?;
                if let Some(message) = state.ready.pop_front() {
                    let delivery = message.to_delivery();
                    self.unsettled.insert(message.tag.clone(), message);
                    return Ok(Some(delivery));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> ClienteleResult<()> {
        self.settle(delivery).map(|_| ())
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> ClienteleResult<()> {
        let message = self.settle(delivery)?;
        if requeue {
            self.queue.requeue(message);
        } else {
            tracing::warn!(tag = %delivery.tag, "Message rejected without requeue, dropped");
        }
        Ok(())
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        for (_, message) in self.unsettled.drain() {
            self.queue.requeue(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_fans_out_to_every_bound_queue() {
        let broker = InMemoryBroker::new();
        let mut a = broker.subscribe("client.upsert", "qa").await.unwrap();
        let mut b = broker.subscribe("client.upsert", "qb").await.unwrap();

        broker.publish("client.upsert", b"hello".to_vec()).await.unwrap();

        assert_eq!(a.next().await.unwrap().unwrap().body, b"hello");
        assert_eq!(b.next().await.unwrap().unwrap().body, b"hello");
    }

    #[tokio::test]
    async fn test_competing_consumers_share_one_queue() {
        let broker = InMemoryBroker::new();
        let mut a = broker.subscribe("t", "q").await.unwrap();
        let mut b = broker.subscribe("t", "q").await.unwrap();

        broker.publish("t", b"1".to_vec()).await.unwrap();
        broker.publish("t", b"2".to_vec()).await.unwrap();

        let first = a.next().await.unwrap().unwrap();
        let second = b.next().await.unwrap().unwrap();
        assert_ne!(first.tag, second.tag);
        assert_eq!(broker.ready_count("q"), 0);
    }

    #[tokio::test]
    async fn test_publish_without_binding_is_dropped() {
        let broker = InMemoryBroker::new();
        broker.publish("nowhere", b"x".to_vec()).await.unwrap();
        assert_eq!(broker.ready_count("nowhere"), 0);
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_flagged() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe("t", "q").await.unwrap();
        broker.publish("t", b"payload".to_vec()).await.unwrap();

        let first = consumer.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        consumer.nack(&first, true).await.unwrap();

        let again = consumer.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.tag, first.tag);
        consumer.ack(&again).await.unwrap();
        assert_eq!(broker.ready_count("q"), 0);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_drops() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe("t", "q").await.unwrap();
        broker.publish("t", b"payload".to_vec()).await.unwrap();

        let delivery = consumer.next().await.unwrap().unwrap();
        consumer.nack(&delivery, false).await.unwrap();
        assert_eq!(broker.ready_count("q"), 0);
    }

    #[tokio::test]
    async fn test_double_ack_is_an_error() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe("t", "q").await.unwrap();
        broker.publish("t", b"payload".to_vec()).await.unwrap();

        let delivery = consumer.next().await.unwrap().unwrap();
        consumer.ack(&delivery).await.unwrap();
        assert!(consumer.ack(&delivery).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_consumer_requeues_unsettled() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe("t", "q").await.unwrap();
        broker.publish("t", b"payload".to_vec()).await.unwrap();
        let _ = consumer.next().await.unwrap().unwrap();
        drop(consumer);

        assert_eq!(broker.ready_count("q"), 1);
        let mut replacement = broker.subscribe("t", "q").await.unwrap();
        assert!(replacement.next().await.unwrap().unwrap().redelivered);
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe("t", "q").await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("t", b"late".to_vec()).await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), consumer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"late");
    }

    #[tokio::test]
    async fn test_close_ends_consumption() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe("t", "q").await.unwrap();
        broker.close();
        assert_eq!(consumer.next().await.unwrap(), None);
    }
}
