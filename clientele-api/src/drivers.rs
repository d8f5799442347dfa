//! Outbound driver selection.
//!
//! Builds the store, cache, broker and workflow engine named by
//! [`DriverConfig`](crate::config::DriverConfig) and hands them out as the
//! trait objects the domain layer expects.

use crate::config::{AppConfig, CacheDriver, DatabaseDriver, MessageDriver, WorkflowDriver};
use crate::db::PostgresIdentityStore;
use clientele_core::{ClienteleResult, LOOKUP_CACHE_TTL, UPSERT_CLIENT_WORKFLOW};
use clientele_delivery::{
    ActivityOptions, InMemoryBroker, InProcessWorkflowEngine, MessageBroker, RedisStreamBroker,
    RedisStreamConfig, WorkflowWorker,
};
use clientele_domain::{
    upsert_activity_options, ClientDeps, ClientService, UpsertClientWorkflow, UpsertEngine,
    UpsertSubscriber,
};
use clientele_storage::{
    IdentityStore, InMemoryIdentityStore, InMemoryLookupCache, LookupCache, RedisLookupCache,
};
use std::sync::Arc;
use std::time::Duration;

/// Connected backends plus the settings needed to build the adapters.
#[derive(Clone)]
pub struct Backends {
    pub deps: ClientDeps,
    /// Concrete engine; workers attach to it directly.
    pub workflows: InProcessWorkflowEngine,
    upsert_queue: String,
    cache_ttl: Duration,
    activity: ActivityOptions,
}

impl Backends {
    /// Connect every backend named in `config`. The Postgres schema is
    /// created when missing.
    pub async fn connect(config: &AppConfig) -> ClienteleResult<Self> {
        let store: Arc<dyn IdentityStore> = match config.drivers.database {
            DatabaseDriver::Postgres => {
                let store = PostgresIdentityStore::from_config(&config.database)?;
                store.ensure_schema().await?;
                Arc::new(store)
            }
            DatabaseDriver::Memory => Arc::new(InMemoryIdentityStore::new()),
        };

        let cache: Arc<dyn LookupCache> = match config.drivers.cache {
            CacheDriver::Redis => Arc::new(
                RedisLookupCache::connect(&config.cache.url())
                    .await?
                    .with_key_prefix(config.cache.key_prefix.clone()),
            ),
            CacheDriver::Memory => Arc::new(InMemoryLookupCache::new()),
        };

        let broker: Arc<dyn MessageBroker> = match config.drivers.message {
            MessageDriver::Redis => {
                let stream_config = RedisStreamConfig {
                    block: config.message.block,
                    ..RedisStreamConfig::default()
                };
                Arc::new(RedisStreamBroker::connect(&config.message.url(), stream_config).await?)
            }
            MessageDriver::Memory => Arc::new(InMemoryBroker::new()),
        };

        let workflows = match config.drivers.workflow {
            WorkflowDriver::InProcess => {
                InProcessWorkflowEngine::new(config.workflow.namespace.clone())
                    .with_run_retention(config.workflow.run_retention)
            }
        };

        tracing::info!(
            database = ?config.drivers.database,
            cache = ?config.drivers.cache,
            message = ?config.drivers.message,
            workflow = ?config.drivers.workflow,
            "Outbound drivers connected"
        );

        Ok(Self::assemble(
            store,
            cache,
            broker,
            workflows,
            config.message.upsert_queue.clone(),
            config.cache.ttl,
            config.workflow.activity.clone(),
        ))
    }

    /// Backends over caller-supplied store and cache, with an in-memory
    /// broker and an in-process engine.
    pub fn with_store(store: Arc<dyn IdentityStore>, cache: Arc<dyn LookupCache>) -> Self {
        Self::assemble(
            store,
            cache,
            Arc::new(InMemoryBroker::new()),
            InProcessWorkflowEngine::default(),
            crate::config::DEFAULT_UPSERT_QUEUE.to_string(),
            LOOKUP_CACHE_TTL,
            upsert_activity_options(),
        )
    }

    /// Every backend in memory.
    pub fn in_memory() -> Self {
        Self::with_store(
            Arc::new(InMemoryIdentityStore::new()),
            Arc::new(InMemoryLookupCache::new()),
        )
    }

    fn assemble(
        store: Arc<dyn IdentityStore>,
        cache: Arc<dyn LookupCache>,
        broker: Arc<dyn MessageBroker>,
        workflows: InProcessWorkflowEngine,
        upsert_queue: String,
        cache_ttl: Duration,
        activity: ActivityOptions,
    ) -> Self {
        Self {
            deps: ClientDeps {
                store,
                cache,
                broker,
                workflows: Arc::new(workflows.clone()),
            },
            workflows,
            upsert_queue,
            cache_ttl,
            activity,
        }
    }

    pub fn upsert_queue(&self) -> &str {
        &self.upsert_queue
    }

    pub fn service(&self) -> ClientService {
        ClientService::new(self.deps.clone()).with_cache_ttl(self.cache_ttl)
    }

    pub fn subscriber(&self) -> UpsertSubscriber {
        UpsertSubscriber::new(
            UpsertEngine::new(Arc::clone(&self.deps.store)),
            self.upsert_queue.clone(),
        )
    }

    /// Worker for the upsert task queue with the upsert workflow registered.
    pub fn worker(&self) -> WorkflowWorker {
        let workflow = UpsertClientWorkflow::new(UpsertEngine::new(Arc::clone(&self.deps.store)))
            .with_activity_options(self.activity.clone());
        self.workflows
            .worker(UPSERT_CLIENT_WORKFLOW)
            .with_workflow(Arc::new(workflow))
    }
}
