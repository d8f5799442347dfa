//! Broker subscriber driving the upsert engine.
//!
//! One message at a time per consumer. Payloads that cannot be decoded, or
//! that decode to a batch the engine rejects as invalid, are acked and
//! dropped. Every other engine failure is nacked with requeue so the broker
//! redelivers the batch later.

use crate::engine::UpsertEngine;
use clientele_core::{
    Activity, ClientInput, ClientRecord, ClienteleError, ClienteleResult, UPSERT_CLIENT_TOPIC,
};
use clientele_delivery::{Consumer, Delivery, Disposition, MessageBroker};
use tokio::sync::watch;
use tracing::Instrument;

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The batch was written and read back.
    Committed(Vec<ClientRecord>),
    /// The payload could not be decoded or failed validation.
    Poisoned(String),
    /// The engine failed; the message should come back.
    Failed(ClienteleError),
}

impl AttemptOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Committed(_) | Self::Poisoned(_) => Disposition::Ack,
            Self::Failed(_) => Disposition::Nack { requeue: true },
        }
    }
}

/// Consumes upsert batches from a queue bound to the upsert topic.
#[derive(Clone)]
pub struct UpsertSubscriber {
    engine: UpsertEngine,
    queue: String,
}

impl UpsertSubscriber {
    pub fn new(engine: UpsertEngine, queue: impl Into<String>) -> Self {
        Self {
            engine,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Process one delivery without settling it.
    pub async fn handle(&self, delivery: &Delivery) -> AttemptOutcome {
        let inputs: Vec<ClientInput> = match serde_json::from_slice(&delivery.body) {
            Ok(inputs) => inputs,
            Err(e) => {
                tracing::error!(
                    tag = %delivery.tag,
                    error = %e,
                    "Undecodable upsert payload, dropping"
                );
                return AttemptOutcome::Poisoned(e.to_string());
            }
        };

        let mut activity = Activity::new("subscribe.upsert_client").with_payload(&inputs);
        let span = activity.span();
        match self.engine.upsert(inputs).instrument(span).await {
            Ok(records) => {
                activity.set_result(&records);
                activity.log_completed();
                AttemptOutcome::Committed(records)
            }
            Err(e) if e.is_invalid_input() => {
                activity.log_failed(&e);
                AttemptOutcome::Poisoned(e.to_string())
            }
            Err(e) => {
                activity.log_failed(&e);
                AttemptOutcome::Failed(e)
            }
        }
    }

    /// Bind to the upsert topic and consume until `shutdown` flips or the
    /// broker closes the queue. The message in hand is finished and settled
    /// before the loop stops.
    pub async fn run(
        &self,
        broker: &dyn MessageBroker,
        shutdown: watch::Receiver<bool>,
    ) -> ClienteleResult<()> {
        let consumer = broker.subscribe(UPSERT_CLIENT_TOPIC, &self.queue).await?;
        self.consume(consumer, shutdown).await
    }

    /// Consume from an existing subscription.
    pub async fn consume(
        &self,
        mut consumer: Box<dyn Consumer>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ClienteleResult<()> {
        tracing::info!(queue = %self.queue, topic = UPSERT_CLIENT_TOPIC, "Upsert subscriber started");

        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = consumer.next() => next?,
            };
            let Some(delivery) = next else {
                tracing::info!(queue = %self.queue, "Queue closed");
                break;
            };

            let outcome = self.handle(&delivery).await;
            let disposition = outcome.disposition();
            consumer.settle(&delivery, disposition).await?;
            tracing::debug!(
                tag = %delivery.tag,
                redelivered = delivery.redelivered,
                disposition = ?disposition,
                "Delivery settled"
            );
        }

        tracing::info!(queue = %self.queue, "Upsert subscriber stopped");
        Ok(())
    }
}
