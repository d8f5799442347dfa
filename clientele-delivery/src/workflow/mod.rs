//! Workflow contract.
//!
//! A workflow is started by name on a task queue under a run id and executed
//! by a worker polling that queue. Its steps run as activities bounded by a
//! start-to-close timeout and retried under a [`RetryPolicy`]. Starting a run
//! id that already exists returns the existing run.

mod context;
mod in_process;

pub use context::WorkflowContext;
pub use in_process::{InProcessWorkflowEngine, WorkflowWorker, DEFAULT_RUN_RETENTION};

use async_trait::async_trait;
use clientele_core::ClienteleResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

// ============================================================================
// OPTIONS
// ============================================================================

/// Exponential backoff between activity attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(100),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let scaled = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = scaled.min(self.max_interval.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Per-activity execution options.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    pub start_to_close_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl ActivityOptions {
    pub fn new(start_to_close_timeout: Duration) -> Self {
        Self {
            start_to_close_timeout,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

// ============================================================================
// RUNS
// ============================================================================

/// Request to start a workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct StartWorkflow {
    pub workflow: String,
    pub task_queue: String,
    /// Explicit run id; generated as `<workflow>-<uuid>` when absent.
    pub run_id: Option<String>,
    pub input: Value,
}

impl StartWorkflow {
    pub fn new(workflow: impl Into<String>, task_queue: impl Into<String>, input: Value) -> Self {
        Self {
            workflow: workflow.into(),
            task_queue: task_queue.into(),
            run_id: None,
            input,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Reference to a started run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub workflow: String,
    pub run_id: String,
}

/// Lifecycle of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for a worker.
    Queued,
    /// Picked up by a worker; `attempt` is the current activity attempt.
    Running { attempt: u32 },
    Completed { result: String },
    Failed { reason: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Workflow definition executed by a worker.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Type name used to route runs to this definition.
    fn name(&self) -> &str;

    /// Run to completion. The returned string is the run's result.
    async fn run(&self, ctx: WorkflowContext, input: Value) -> ClienteleResult<String>;
}

/// Client side of a workflow engine.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn start(&self, request: StartWorkflow) -> ClienteleResult<RunHandle>;

    async fn status(&self, run_id: &str) -> ClienteleResult<RunStatus>;

    /// Wait for the run to finish. A failed run is returned as
    /// `DeliveryError::WorkflowFailed`.
    async fn await_result(&self, run_id: &str) -> ClienteleResult<String>;
}
