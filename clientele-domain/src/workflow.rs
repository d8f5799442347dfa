//! Upsert workflow: one retried, timeout-bounded activity around the engine.

use crate::engine::UpsertEngine;
use async_trait::async_trait;
use clientele_core::{
    generate_bearer_key, Activity, ClientInput, ClienteleResult, DeliveryError, ValidationError,
    UPSERT_ACTIVITY_TIMEOUT, UPSERT_CLIENT_ACTIVITY, UPSERT_CLIENT_WORKFLOW,
};
use clientele_delivery::{ActivityOptions, RetryPolicy, Workflow, WorkflowContext};
use serde_json::Value;
use tracing::Instrument;

/// Default activity options: five-minute start-to-close, default retry policy.
pub fn upsert_activity_options() -> ActivityOptions {
    ActivityOptions::new(UPSERT_ACTIVITY_TIMEOUT).with_retry_policy(RetryPolicy::default())
}

/// Runs the upsert engine for a single client input.
///
/// Succeeds with `"Bearer key: <key>"`. On failure the run fails with
/// `"Failed to upsert client: <cause>"`.
#[derive(Clone)]
pub struct UpsertClientWorkflow {
    engine: UpsertEngine,
    options: ActivityOptions,
}

impl UpsertClientWorkflow {
    pub fn new(engine: UpsertEngine) -> Self {
        Self {
            engine,
            options: upsert_activity_options(),
        }
    }

    pub fn with_activity_options(mut self, options: ActivityOptions) -> Self {
        self.options = options;
        self
    }

    /// The bearer key is fixed before the first attempt, so every retry
    /// writes the same row. Returns that row's key.
    async fn upsert_one(
        &self,
        ctx: &WorkflowContext,
        mut input: ClientInput,
    ) -> ClienteleResult<String> {
        if input.bearer_key.is_empty() {
            input.bearer_key = generate_bearer_key();
        }

        let records = ctx
            .execute_activity(UPSERT_CLIENT_ACTIVITY, &self.options, |_attempt| {
                let engine = self.engine.clone();
                let input = input.clone();
                async move { engine.upsert(vec![input]).await }
            })
            .await?;

        let bearer_key = records
            .into_iter()
            .find(|r| r.bearer_key == input.bearer_key)
            .map(|r| r.bearer_key)
            .ok_or_else(|| DeliveryError::WorkflowFailed {
                run_id: ctx.run_id().to_string(),
                reason: "upsert returned no record".to_string(),
            })?;
        Ok(bearer_key)
    }
}

#[async_trait]
impl Workflow for UpsertClientWorkflow {
    fn name(&self) -> &str {
        UPSERT_CLIENT_WORKFLOW
    }

    async fn run(&self, ctx: WorkflowContext, input: Value) -> ClienteleResult<String> {
        let mut activity = Activity::new("workflow.upsert_client").with_payload(&input);
        let span = activity.span();

        let outcome = async {
            let input: ClientInput =
                serde_json::from_value(input).map_err(|e| ValidationError::InvalidValue {
                    field: "input".to_string(),
                    reason: e.to_string(),
                })?;
            self.upsert_one(&ctx, input).await
        }
        .instrument(span)
        .await;

        match outcome {
            Ok(bearer_key) => {
                activity.set_result(&serde_json::json!({ "bearer_key": bearer_key }));
                activity.log_completed();
                Ok(format!("Bearer key: {}", bearer_key))
            }
            Err(e) => {
                activity.log_failed(&e);
                Err(DeliveryError::WorkflowFailed {
                    run_id: ctx.run_id().to_string(),
                    reason: format!("Failed to upsert client: {}", e.root_cause()),
                }
                .into())
            }
        }
    }
}
