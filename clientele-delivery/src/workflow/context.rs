//! Execution context handed to a running workflow.

use super::{ActivityOptions, RunStatus};
use clientele_core::{ClienteleError, ClienteleResult, DeliveryError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Identity of the current run plus activity execution.
#[derive(Clone)]
pub struct WorkflowContext {
    run_id: String,
    workflow: String,
    status: Arc<watch::Sender<RunStatus>>,
}

impl WorkflowContext {
    pub(crate) fn new(
        run_id: impl Into<String>,
        workflow: impl Into<String>,
        status: Arc<watch::Sender<RunStatus>>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            workflow: workflow.into(),
            status,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// Run an activity under `options`.
    ///
    /// Each attempt is bounded by the start-to-close timeout; an attempt that
    /// runs over is cancelled and counts as failed. Failed attempts are
    /// retried with backoff until the policy is exhausted, except validation
    /// errors, which fail immediately. The last error is returned.
    pub async fn execute_activity<T, F, Fut>(
        &self,
        activity: &str,
        options: &ActivityOptions,
        mut attempt_fn: F,
    ) -> ClienteleResult<T>
    where
        T: Send,
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = ClienteleResult<T>> + Send,
    {
        let max_attempts = options.retry_policy.attempts();
        let mut attempt = 1;

        loop {
            self.status.send_replace(RunStatus::Running { attempt });

            let outcome =
                match tokio::time::timeout(options.start_to_close_timeout, attempt_fn(attempt))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ClienteleError::from(DeliveryError::ActivityTimeout {
                        activity: activity.to_string(),
                        timeout: options.start_to_close_timeout,
                    })),
                };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_invalid_input() || attempt >= max_attempts {
                tracing::warn!(
                    run_id = %self.run_id,
                    activity = %activity,
                    attempt,
                    error = %err,
                    "Activity failed, not retrying"
                );
                return Err(err);
            }

            let delay = options.retry_policy.backoff(attempt);
            tracing::warn!(
                run_id = %self.run_id,
                activity = %activity,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Activity attempt failed"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::RetryPolicy;
    use clientele_core::{StoreError, ValidationError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn context() -> (WorkflowContext, watch::Receiver<RunStatus>) {
        let (tx, rx) = watch::channel(RunStatus::Queued);
        (WorkflowContext::new("run-1", "Test", Arc::new(tx)), rx)
    }

    fn options(max_attempts: u32) -> ActivityOptions {
        ActivityOptions::new(Duration::from_secs(1)).with_retry_policy(RetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(10),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_millis(50),
        })
    }

    fn transient() -> ClienteleError {
        StoreError::Connection {
            reason: "reset".to_string(),
        }
        .into()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let (ctx, rx) = context();
        let calls = AtomicU32::new(0);
        let result = ctx
            .execute_activity("act", &options(5), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(transient())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(*rx.borrow(), RunStatus::Running { attempt: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_return_last_error() {
        let (ctx, _rx) = context();
        let calls = AtomicU32::new(0);
        let err = ctx
            .execute_activity("act", &options(3), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(transient()) }
            })
            .await
            .unwrap_err();

        assert_eq!(err, transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_is_not_retried() {
        let (ctx, _rx) = context();
        let calls = AtomicU32::new(0);
        let err = ctx
            .execute_activity("act", &options(5), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ValidationError::EmptyInput.into()) }
            })
            .await
            .unwrap_err();

        assert!(err.is_invalid_input());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_attempt_counts_as_failure() {
        let (ctx, _rx) = context();
        let result = ctx
            .execute_activity("slow", &options(2), |attempt| async move {
                if attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok(attempt)
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_error_when_every_attempt_overruns() {
        let (ctx, _rx) = context();
        let err = ctx
            .execute_activity("slow", &options(1), |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClienteleError::Delivery(DeliveryError::ActivityTimeout { .. })
        ));
    }
}
