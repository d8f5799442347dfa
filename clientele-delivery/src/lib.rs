//! Clientele Delivery - Asynchronous Transports
//!
//! Narrow contracts for the two out-of-band paths that drive upserts:
//! a fan-out message broker with ack/nack redelivery, and a workflow
//! engine that runs a retried, timeout-bounded activity.
//!
//! Drivers:
//! - [`InMemoryBroker`]: process-local queues, for tests and single-process runs
//! - [`RedisStreamBroker`]: Redis Streams with one consumer group per queue
//! - [`InProcessWorkflowEngine`]: task queues and workers inside this process

pub mod broker;
pub mod workflow;

pub use broker::{
    Consumer, Delivery, Disposition, InMemoryBroker, MessageBroker, RedisStreamBroker,
    RedisStreamConfig,
};
pub use workflow::{
    ActivityOptions, InProcessWorkflowEngine, RetryPolicy, RunHandle, RunStatus, StartWorkflow,
    Workflow, WorkflowContext, WorkflowEngine, WorkflowWorker, DEFAULT_RUN_RETENTION,
};
