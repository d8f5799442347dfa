//! Operations exposed to transports.

use crate::engine::UpsertEngine;
use crate::resolver::{ExistenceResolver, Resolution};
use clientele_core::{
    generate_bearer_key, ClientFilter, ClientInput, ClientRecord, ClienteleResult, DeliveryError,
    ValidationError, UPSERT_CLIENT_TOPIC, UPSERT_CLIENT_WORKFLOW,
};
use clientele_delivery::{MessageBroker, RunHandle, RunStatus, StartWorkflow, WorkflowEngine};
use clientele_storage::{IdentityStore, LookupCache};
use std::sync::Arc;
use std::time::Duration;

/// Backend handles, chosen at startup and injected.
#[derive(Clone)]
pub struct ClientDeps {
    pub store: Arc<dyn IdentityStore>,
    pub cache: Arc<dyn LookupCache>,
    pub broker: Arc<dyn MessageBroker>,
    pub workflows: Arc<dyn WorkflowEngine>,
}

/// Client operations over the injected backends.
#[derive(Clone)]
pub struct ClientService {
    store: Arc<dyn IdentityStore>,
    broker: Arc<dyn MessageBroker>,
    workflows: Arc<dyn WorkflowEngine>,
    engine: UpsertEngine,
    resolver: ExistenceResolver,
}

impl ClientService {
    pub fn new(deps: ClientDeps) -> Self {
        Self {
            engine: UpsertEngine::new(Arc::clone(&deps.store)),
            resolver: ExistenceResolver::new(Arc::clone(&deps.store), deps.cache),
            store: deps.store,
            broker: deps.broker,
            workflows: deps.workflows,
        }
    }

    /// Override the lookup cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.resolver = self.resolver.with_ttl(ttl);
        self
    }

    pub fn engine(&self) -> &UpsertEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// Create or update clients synchronously.
    pub async fn upsert(&self, inputs: Vec<ClientInput>) -> ClienteleResult<Vec<ClientRecord>> {
        self.engine.upsert(inputs).await
    }

    pub async fn find_by_filter(
        &self,
        filter: &ClientFilter,
        lock: bool,
    ) -> ClienteleResult<Vec<ClientRecord>> {
        filter.validate()?;
        self.store.find_by_filter(filter, lock).await
    }

    pub async fn delete_by_filter(&self, filter: &ClientFilter) -> ClienteleResult<u64> {
        filter.validate()?;
        let removed = self.store.delete_by_filter(filter).await?;
        tracing::info!(removed, "Deleted clients");
        Ok(removed)
    }

    pub async fn is_exists(&self, bearer_key: &str) -> ClienteleResult<bool> {
        self.resolver.is_exists(bearer_key).await
    }

    /// Existence check that also reports the record, when known.
    pub async fn resolve(&self, bearer_key: &str) -> ClienteleResult<Resolution> {
        self.resolver.resolve(bearer_key).await
    }

    /// Publish a batch for the upsert subscribers. Returns once the broker
    /// has accepted the message.
    ///
    /// Missing bearer keys are generated here, so a redelivered message
    /// rewrites the same rows.
    pub async fn publish_upsert(&self, mut inputs: Vec<ClientInput>) -> ClienteleResult<()> {
        if inputs.is_empty() {
            return Err(ValidationError::EmptyInput.into());
        }
        for input in inputs.iter_mut().filter(|i| i.bearer_key.is_empty()) {
            input.bearer_key = generate_bearer_key();
        }
        let body = serde_json::to_vec(&inputs).map_err(|e| DeliveryError::Serialization {
            reason: e.to_string(),
        })?;
        self.broker.publish(UPSERT_CLIENT_TOPIC, body).await?;
        tracing::info!(topic = UPSERT_CLIENT_TOPIC, clients = inputs.len(), "Upsert published");
        Ok(())
    }

    /// Start an upsert workflow run for one client under a fresh run id.
    pub async fn start_upsert(&self, input: ClientInput) -> ClienteleResult<RunHandle> {
        let payload = serde_json::to_value(&input).map_err(|e| DeliveryError::Serialization {
            reason: e.to_string(),
        })?;
        self.workflows
            .start(StartWorkflow::new(
                UPSERT_CLIENT_WORKFLOW,
                UPSERT_CLIENT_WORKFLOW,
                payload,
            ))
            .await
    }

    pub async fn workflow_status(&self, run_id: &str) -> ClienteleResult<RunStatus> {
        self.workflows.status(run_id).await
    }

    /// Wait for a run started by [`start_upsert`](Self::start_upsert).
    pub async fn await_upsert(&self, run_id: &str) -> ClienteleResult<String> {
        self.workflows.await_result(run_id).await
    }
}
