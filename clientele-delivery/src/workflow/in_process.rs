//! In-process workflow engine.
//!
//! Task queues are unbounded channels inside this process; workers poll a
//! queue and execute runs on their own tasks, bounded by a concurrency limit.
//! Run state lives in memory, so runs do not survive a restart. Finished
//! runs are kept for a retention window so callers can read their result,
//! then evicted the next time a run starts.

use super::context::WorkflowContext;
use super::{RunHandle, RunStatus, StartWorkflow, Workflow, WorkflowEngine};
use async_trait::async_trait;
use clientele_core::{ClienteleError, ClienteleResult, DeliveryError};
use futures_util::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

/// Runs a worker executes at once unless configured otherwise.
const DEFAULT_MAX_CONCURRENT_RUNS: usize = 16;

/// How long a finished run's status stays readable.
pub const DEFAULT_RUN_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct RunRequest {
    run_id: String,
    workflow: String,
    input: Value,
}

#[derive(Clone)]
struct TaskQueue {
    sender: mpsc::UnboundedSender<RunRequest>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RunRequest>>>,
}

impl TaskQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }
}

struct RunSlot {
    status: Arc<watch::Sender<RunStatus>>,
    finished_at: Option<Instant>,
}

struct EngineInner {
    namespace: String,
    queues: Mutex<HashMap<String, TaskQueue>>,
    runs: Mutex<HashMap<String, RunSlot>>,
}

/// [`WorkflowEngine`] whose runs execute on [`WorkflowWorker`]s in this process.
#[derive(Clone)]
pub struct InProcessWorkflowEngine {
    inner: Arc<EngineInner>,
    run_retention: Duration,
}

impl Default for InProcessWorkflowEngine {
    fn default() -> Self {
        Self::new("default")
    }
}

impl InProcessWorkflowEngine {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                namespace: namespace.into(),
                queues: Mutex::new(HashMap::new()),
                runs: Mutex::new(HashMap::new()),
            }),
            run_retention: DEFAULT_RUN_RETENTION,
        }
    }

    /// Keep finished runs readable for `retention` before eviction.
    /// A run id reused after eviction starts a new run.
    pub fn with_run_retention(mut self, retention: Duration) -> Self {
        self.run_retention = retention;
        self
    }

    pub fn run_retention(&self) -> Duration {
        self.run_retention
    }

    /// Number of runs whose state is held, finished or not.
    pub fn tracked_runs(&self) -> usize {
        self.inner.runs.lock().map(|runs| runs.len()).unwrap_or(0)
    }

    /// Drop finished runs older than the retention window. Returns how many
    /// were evicted.
    pub fn evict_finished_runs(&self) -> ClienteleResult<usize> {
        let mut runs = self
            .inner
            .runs
            .lock()
            .map_err(|_| DeliveryError::LockPoisoned)?;
        Ok(evict_expired(&mut runs, self.run_retention))
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Worker polling `task_queue`. Register workflows before running it.
    pub fn worker(&self, task_queue: impl Into<String>) -> WorkflowWorker {
        WorkflowWorker {
            engine: self.clone(),
            task_queue: task_queue.into(),
            workflows: HashMap::new(),
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
        }
    }

    fn task_queue(&self, name: &str) -> ClienteleResult<TaskQueue> {
        let mut queues = self
            .inner
            .queues
            .lock()
            .map_err(|_| DeliveryError::LockPoisoned)?;
        Ok(queues.entry(name.to_string()).or_insert_with(TaskQueue::new).clone())
    }

    fn run_sender(&self, run_id: &str) -> ClienteleResult<Arc<watch::Sender<RunStatus>>> {
        let runs = self
            .inner
            .runs
            .lock()
            .map_err(|_| DeliveryError::LockPoisoned)?;
        runs.get(run_id)
            .map(|slot| Arc::clone(&slot.status))
            .ok_or_else(|| {
                DeliveryError::UnknownRun {
                    run_id: run_id.to_string(),
                }
                .into()
            })
    }

    fn mark_finished(&self, run_id: &str) {
        match self.inner.runs.lock() {
            Ok(mut runs) => {
                if let Some(slot) = runs.get_mut(run_id) {
                    slot.finished_at = Some(Instant::now());
                }
            }
            Err(_) => tracing::error!(run_id = %run_id, "Run table lock poisoned"),
        }
    }
}

fn evict_expired(runs: &mut HashMap<String, RunSlot>, retention: Duration) -> usize {
    let before = runs.len();
    let now = Instant::now();
    runs.retain(|_, slot| match slot.finished_at {
        Some(finished) => now.duration_since(finished) < retention,
        None => true,
    });
    let evicted = before - runs.len();
    if evicted > 0 {
        tracing::debug!(evicted, "Evicted finished workflow runs");
    }
    evicted
}

#[async_trait]
impl WorkflowEngine for InProcessWorkflowEngine {
    async fn start(&self, request: StartWorkflow) -> ClienteleResult<RunHandle> {
        if request.workflow.is_empty() || request.task_queue.is_empty() {
            return Err(DeliveryError::WorkflowStart {
                workflow: request.workflow,
                reason: "workflow and task queue names are required".to_string(),
            }
            .into());
        }

        let run_id = request
            .run_id
            .unwrap_or_else(|| format!("{}-{}", request.workflow, Uuid::new_v4()));
        let handle = RunHandle {
            workflow: request.workflow.clone(),
            run_id: run_id.clone(),
        };

        {
            let mut runs = self
                .inner
                .runs
                .lock()
                .map_err(|_| DeliveryError::LockPoisoned)?;
            evict_expired(&mut runs, self.run_retention);
            if runs.contains_key(&run_id) {
                tracing::debug!(run_id = %run_id, "Run already started");
                return Ok(handle);
            }
            let (status, _) = watch::channel(RunStatus::Queued);
            runs.insert(
                run_id.clone(),
                RunSlot {
                    status: Arc::new(status),
                    finished_at: None,
                },
            );
        }

        let queue = self.task_queue(&request.task_queue)?;
        queue
            .sender
            .send(RunRequest {
                run_id: run_id.clone(),
                workflow: request.workflow.clone(),
                input: request.input,
            })
            .map_err(|e| DeliveryError::WorkflowStart {
                workflow: request.workflow.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            namespace = %self.inner.namespace,
            workflow = %request.workflow,
            task_queue = %request.task_queue,
            run_id = %run_id,
            "Workflow started"
        );
        Ok(handle)
    }

    async fn status(&self, run_id: &str) -> ClienteleResult<RunStatus> {
        Ok(self.run_sender(run_id)?.borrow().clone())
    }

    async fn await_result(&self, run_id: &str) -> ClienteleResult<String> {
        let mut receiver = self.run_sender(run_id)?.subscribe();
        let status = receiver
            .wait_for(RunStatus::is_terminal)
            .await
            .map_err(|e| DeliveryError::WorkflowFailed {
                run_id: run_id.to_string(),
                reason: e.to_string(),
            })?
            .clone();

        match status {
            RunStatus::Completed { result } => Ok(result),
            RunStatus::Failed { reason } => Err(DeliveryError::WorkflowFailed {
                run_id: run_id.to_string(),
                reason,
            }
            .into()),
            RunStatus::Queued | RunStatus::Running { .. } => Err(DeliveryError::WorkflowFailed {
                run_id: run_id.to_string(),
                reason: "run ended without a terminal state".to_string(),
            }
            .into()),
        }
    }
}

// ============================================================================
// WORKER
// ============================================================================

/// Polls one task queue and executes the runs routed to it.
pub struct WorkflowWorker {
    engine: InProcessWorkflowEngine,
    task_queue: String,
    workflows: HashMap<String, Arc<dyn Workflow>>,
    max_concurrent_runs: usize,
}

impl WorkflowWorker {
    pub fn with_workflow(mut self, workflow: Arc<dyn Workflow>) -> Self {
        self.workflows.insert(workflow.name().to_string(), workflow);
        self
    }

    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max.max(1);
        self
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// Poll until `shutdown` flips to true, then wait for in-flight runs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ClienteleResult<()> {
        let queue = self.engine.task_queue(&self.task_queue)?;
        let permits = Arc::new(Semaphore::new(self.max_concurrent_runs));
        let mut in_flight = JoinSet::new();

        tracing::info!(
            task_queue = %self.task_queue,
            workflows = ?self.workflows.keys().collect::<Vec<_>>(),
            "Workflow worker started"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let request = tokio::select! {
                _ = shutdown.changed() => break,
                request = async { queue.receiver.lock().await.recv().await } => request,
            };
            let Some(request) = request else { break };

            let status = match self.engine.run_sender(&request.run_id) {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!(run_id = %request.run_id, error = %e, "Dropping run without state");
                    continue;
                }
            };

            let workflow = self.workflows.get(&request.workflow).cloned();
            let task_queue = self.task_queue.clone();
            let engine = self.engine.clone();
            in_flight.spawn(async move {
                let run_id = request.run_id.clone();
                execute_run(workflow, task_queue, request, status).await;
                engine.mark_finished(&run_id);
                drop(permit);
            });

            while let Some(Some(joined)) = in_flight.join_next().now_or_never() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Workflow run task failed");
                }
            }
        }

        tracing::info!(task_queue = %self.task_queue, "Workflow worker draining");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Workflow run task failed");
            }
        }
        tracing::info!(task_queue = %self.task_queue, "Workflow worker stopped");
        Ok(())
    }
}

async fn execute_run(
    workflow: Option<Arc<dyn Workflow>>,
    task_queue: String,
    request: RunRequest,
    status: Arc<watch::Sender<RunStatus>>,
) {
    let Some(workflow) = workflow else {
        let err = DeliveryError::UnregisteredWorkflow {
            workflow: request.workflow.clone(),
            task_queue,
        };
        tracing::error!(run_id = %request.run_id, error = %err, "Workflow run failed");
        status.send_replace(RunStatus::Failed {
            reason: err.to_string(),
        });
        return;
    };

    status.send_replace(RunStatus::Running { attempt: 0 });
    let ctx = WorkflowContext::new(&request.run_id, &request.workflow, Arc::clone(&status));

    let outcome = AssertUnwindSafe(workflow.run(ctx, request.input))
        .catch_unwind()
        .await;

    let final_status = match outcome {
        Ok(Ok(result)) => {
            tracing::info!(run_id = %request.run_id, "Workflow run completed");
            RunStatus::Completed { result }
        }
        Ok(Err(e)) => {
            tracing::error!(run_id = %request.run_id, error = %e, "Workflow run failed");
            let reason = match e {
                ClienteleError::Delivery(DeliveryError::WorkflowFailed { reason, .. }) => reason,
                other => other.root_cause(),
            };
            RunStatus::Failed { reason }
        }
        Err(_) => {
            tracing::error!(run_id = %request.run_id, "Workflow run panicked");
            RunStatus::Failed {
                reason: "workflow panicked".to_string(),
            }
        }
    };
    status.send_replace(final_status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ActivityOptions, RetryPolicy};
    use clientele_core::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo;

    #[async_trait]
    impl Workflow for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        async fn run(&self, _ctx: WorkflowContext, input: Value) -> ClienteleResult<String> {
            Ok(format!("echo: {}", input))
        }
    }

    struct FlakyTwice {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Workflow for FlakyTwice {
        fn name(&self) -> &str {
            "FlakyTwice"
        }

        async fn run(&self, ctx: WorkflowContext, _input: Value) -> ClienteleResult<String> {
            let options = ActivityOptions::new(Duration::from_secs(1)).with_retry_policy(
                RetryPolicy {
                    max_attempts: 5,
                    initial_interval: Duration::from_millis(1),
                    backoff_coefficient: 1.0,
                    max_interval: Duration::from_millis(1),
                },
            );
            ctx.execute_activity("flaky", &options, |attempt| {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 2 {
                        Err(StoreError::Connection {
                            reason: "down".to_string(),
                        }
                        .into())
                    } else {
                        Ok(format!("attempt {}", attempt))
                    }
                }
            })
            .await
        }
    }

    struct Panics;

    #[async_trait]
    impl Workflow for Panics {
        fn name(&self) -> &str {
            "Panics"
        }

        async fn run(&self, _ctx: WorkflowContext, _input: Value) -> ClienteleResult<String> {
            panic!("boom")
        }
    }

    fn spawn_worker(
        engine: &InProcessWorkflowEngine,
        queue: &str,
        workflows: Vec<Arc<dyn Workflow>>,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<ClienteleResult<()>>) {
        let (tx, rx) = watch::channel(false);
        let mut worker = engine.worker(queue);
        for wf in workflows {
            worker = worker.with_workflow(wf);
        }
        (tx, tokio::spawn(worker.run(rx)))
    }

    #[tokio::test]
    async fn test_run_completes_with_result() {
        let engine = InProcessWorkflowEngine::default();
        let (_shutdown, _worker) = spawn_worker(&engine, "q", vec![Arc::new(Echo)]);

        let handle = engine
            .start(StartWorkflow::new("Echo", "q", serde_json::json!("hi")))
            .await
            .unwrap();
        assert!(handle.run_id.starts_with("Echo-"));

        let result = engine.await_result(&handle.run_id).await.unwrap();
        assert_eq!(result, "echo: \"hi\"");
        assert!(engine.status(&handle.run_id).await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_run_queued_before_worker_starts() {
        let engine = InProcessWorkflowEngine::default();
        let handle = engine
            .start(StartWorkflow::new("Echo", "q", Value::Null))
            .await
            .unwrap();
        assert_eq!(engine.status(&handle.run_id).await.unwrap(), RunStatus::Queued);

        let (_shutdown, _worker) = spawn_worker(&engine, "q", vec![Arc::new(Echo)]);
        assert_eq!(engine.await_result(&handle.run_id).await.unwrap(), "echo: null");
    }

    #[tokio::test]
    async fn test_same_run_id_is_deduplicated() {
        let engine = InProcessWorkflowEngine::default();
        let first = engine
            .start(StartWorkflow::new("Echo", "q", Value::Null).with_run_id("fixed"))
            .await
            .unwrap();
        let second = engine
            .start(StartWorkflow::new("Echo", "q", Value::Null).with_run_id("fixed"))
            .await
            .unwrap();
        assert_eq!(first, second);

        let queue = engine.task_queue("q").unwrap();
        let mut receiver = queue.receiver.lock().await;
        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transient_activity_failure_is_retried() {
        let engine = InProcessWorkflowEngine::default();
        let flaky = Arc::new(FlakyTwice {
            calls: AtomicU32::new(0),
        });
        let (_shutdown, _worker) = spawn_worker(&engine, "q", vec![flaky.clone()]);

        let handle = engine
            .start(StartWorkflow::new("FlakyTwice", "q", Value::Null))
            .await
            .unwrap();
        assert_eq!(engine.await_result(&handle.run_id).await.unwrap(), "attempt 3");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unregistered_workflow_fails_run() {
        let engine = InProcessWorkflowEngine::default();
        let (_shutdown, _worker) = spawn_worker(&engine, "q", vec![Arc::new(Echo)]);

        let handle = engine
            .start(StartWorkflow::new("Missing", "q", Value::Null))
            .await
            .unwrap();
        let err = engine.await_result(&handle.run_id).await.unwrap_err();
        assert!(err.to_string().contains("No workflow registered for Missing"));
    }

    #[tokio::test]
    async fn test_panicking_workflow_fails_run() {
        let engine = InProcessWorkflowEngine::default();
        let (_shutdown, _worker) = spawn_worker(&engine, "q", vec![Arc::new(Panics)]);

        let handle = engine
            .start(StartWorkflow::new("Panics", "q", Value::Null))
            .await
            .unwrap();
        let err = engine.await_result(&handle.run_id).await.unwrap_err();
        assert!(err.to_string().contains("workflow panicked"));
    }

    #[tokio::test]
    async fn test_unknown_run_id() {
        let engine = InProcessWorkflowEngine::default();
        let err = engine.status("nope").await.unwrap_err();
        assert!(err.to_string().contains("Unknown workflow run"));
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let engine = InProcessWorkflowEngine::default();
        let (shutdown, worker) = spawn_worker(&engine, "q", vec![Arc::new(Echo)]);
        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_finished_runs_kept_within_retention() {
        let engine = InProcessWorkflowEngine::default();
        let (_shutdown, _worker) = spawn_worker(&engine, "q", vec![Arc::new(Echo)]);

        let handle = engine
            .start(StartWorkflow::new("Echo", "q", Value::Null))
            .await
            .unwrap();
        engine.await_result(&handle.run_id).await.unwrap();

        assert_eq!(engine.evict_finished_runs().unwrap(), 0);
        assert_eq!(engine.await_result(&handle.run_id).await.unwrap(), "echo: null");
    }

    #[tokio::test]
    async fn test_finished_runs_evicted_after_retention() {
        let engine = InProcessWorkflowEngine::default().with_run_retention(Duration::ZERO);
        let (_shutdown, _worker) = spawn_worker(&engine, "q", vec![Arc::new(Echo)]);

        let mut finished = Vec::new();
        for _ in 0..3 {
            let handle = engine
                .start(StartWorkflow::new("Echo", "q", Value::Null))
                .await
                .unwrap();
            engine.await_result(&handle.run_id).await.unwrap();
            finished.push(handle.run_id);
        }

        // Completion is published before the slot is stamped finished.
        for _ in 0..200 {
            engine.evict_finished_runs().unwrap();
            if engine.tracked_runs() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.tracked_runs(), 0);
        for run_id in &finished {
            let err = engine.status(run_id).await.unwrap_err();
            assert!(err.to_string().contains("Unknown workflow run"));
        }
    }

    #[tokio::test]
    async fn test_start_sweeps_expired_runs_but_keeps_pending_ones() {
        let engine = InProcessWorkflowEngine::default().with_run_retention(Duration::ZERO);
        let (shutdown, worker) = spawn_worker(&engine, "q", vec![Arc::new(Echo)]);

        let done = engine
            .start(StartWorkflow::new("Echo", "q", Value::Null))
            .await
            .unwrap();
        engine.await_result(&done.run_id).await.unwrap();
        shutdown.send(true).unwrap();
        worker.await.unwrap().unwrap();

        // No worker polls "idle", so this run stays queued.
        let pending = engine
            .start(StartWorkflow::new("Echo", "idle", Value::Null))
            .await
            .unwrap();
        for _ in 0..200 {
            engine
                .start(StartWorkflow::new("Echo", "idle", Value::Null).with_run_id(&pending.run_id))
                .await
                .unwrap();
            if engine.status(&done.run_id).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(engine.status(&done.run_id).await.is_err());
        assert_eq!(engine.status(&pending.run_id).await.unwrap(), RunStatus::Queued);
        assert_eq!(engine.tracked_runs(), 1);
    }
}
