//! Clientele Domain - Upsert and Consistency Pipeline
//!
//! The upsert engine, the cache-aside existence resolver, and the two
//! asynchronous adapters (broker subscriber and workflow) that drive the
//! engine out of band. [`ClientService`] bundles them behind the operations
//! exposed to transports.

pub mod engine;
pub mod resolver;
pub mod service;
pub mod subscriber;
pub mod workflow;

pub use engine::UpsertEngine;
pub use resolver::{ExistenceResolver, Resolution};
pub use service::{ClientDeps, ClientService};
pub use subscriber::{AttemptOutcome, UpsertSubscriber};
pub use workflow::{upsert_activity_options, UpsertClientWorkflow};
