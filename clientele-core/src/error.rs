//! Error types for clientele operations

use std::time::Duration;
use thiserror::Error;

/// Input rejected before any I/O. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Empty input: at least one client is required")]
    EmptyInput,

    #[error("Invalid filter: at least one of ids, names or bearer_keys must be set")]
    InvalidFilter,

    #[error("Empty bearer key")]
    EmptyKey,

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Identity store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store connection failed: {reason}")]
    Connection { reason: String },

    #[error("Store pool error: {reason}")]
    Pool { reason: String },

    #[error("Query failed: {reason}")]
    Query { reason: String },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Lookup cache errors. A miss is not an error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend error: {reason}")]
    Backend { reason: String },

    #[error("Corrupt cache entry for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Broker and workflow delivery errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Failed to connect to {target}: {reason}")]
    Dial { target: String, reason: String },

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Subscribe to {queue} failed: {reason}")]
    Subscribe { queue: String, reason: String },

    #[error("Settling delivery {tag} failed: {reason}")]
    Settle { tag: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Starting workflow {workflow} failed: {reason}")]
    WorkflowStart { workflow: String, reason: String },

    #[error("Workflow run {run_id} failed: {reason}")]
    WorkflowFailed { run_id: String, reason: String },

    #[error("Activity {activity} exceeded its {timeout:?} timeout")]
    ActivityTimeout { activity: String, timeout: Duration },

    #[error("Unknown workflow run: {run_id}")]
    UnknownRun { run_id: String },

    #[error("No workflow registered for {workflow} on queue {task_queue}")]
    UnregisteredWorkflow { workflow: String, task_queue: String },

    #[error("Delivery state lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Driver not supported for {role}: {driver}")]
    DriverNotSupported { role: String, driver: String },
}

/// Master error type for all clientele errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClienteleError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl ClienteleError {
    /// True for errors raised before any I/O.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Message of the innermost error, without the layer prefix.
    pub fn root_cause(&self) -> String {
        match self {
            Self::Validation(e) => e.to_string(),
            Self::Store(e) => e.to_string(),
            Self::Cache(e) => e.to_string(),
            Self::Delivery(e) => e.to_string(),
            Self::Config(e) => e.to_string(),
        }
    }
}

/// Result type alias for clientele operations.
pub type ClienteleResult<T> = Result<T, ClienteleError>;

// =============================================================================
// TESTS
// =============================================================================
