//! Request metadata carried alongside a single operation for logging.
//!
//! Inbound adapters (HTTP handlers, the subscriber, the workflow worker,
//! CLI commands) create one [`Activity`] per trigger, run the work inside
//! its span, then record the outcome.
//!
//! Payloads and results are redacted on the way in: bearer keys never reach
//! the log sink in full.

use serde::Serialize;
use serde_json::Value;
use tracing::{info_span, Span};
use uuid::Uuid;

/// Object keys whose values are client credentials.
const SECRET_FIELDS: &[&str] = &["bearer_key", "bearer_keys"];

/// Characters of a bearer key kept when it is logged.
const MASK_VISIBLE: usize = 4;

/// Mask a bearer key for logging, keeping a short prefix for correlation.
/// Keys too short to keep a prefix are masked entirely.
pub fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= MASK_VISIBLE * 2 {
        return "***".to_string();
    }
    let prefix: String = secret.chars().take(MASK_VISIBLE).collect();
    format!("{}***", prefix)
}

fn mask_value(value: &mut Value) {
    match value {
        Value::String(s) => *s = mask_secret(s),
        Value::Array(items) => items.iter_mut().for_each(mask_value),
        _ => {}
    }
}

/// Serialize `value` and mask every credential field, at any depth.
fn redacted<T: Serialize + ?Sized>(value: &T) -> Value {
    let mut value = serde_json::to_value(value).unwrap_or(Value::Null);
    redact(&mut value);
    value
}

fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                if SECRET_FIELDS.contains(&key.as_str()) {
                    mask_value(field);
                } else {
                    redact(field);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

/// Per-trigger metadata: a transaction id, the action name, and optionally
/// the client involved, the input payload and the result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    pub transaction_id: Uuid,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Activity {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            action: action.into(),
            client_id: None,
            payload: None,
            result: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Attach the serialized, redacted input. Unserializable payloads are
    /// recorded as null.
    pub fn with_payload<T: Serialize + ?Sized>(mut self, payload: &T) -> Self {
        self.payload = Some(redacted(payload));
        self
    }

    pub fn set_result<T: Serialize + ?Sized>(&mut self, result: &T) {
        self.result = Some(redacted(result));
    }

    /// Span carrying the transaction id and action. Everything logged while
    /// the span is entered inherits both fields.
    pub fn span(&self) -> Span {
        info_span!(
            "activity",
            transaction_id = %self.transaction_id,
            action = %self.action,
            client_id = self.client_id.as_deref().unwrap_or(""),
        )
    }

    /// Emit the completion event with payload and result attached.
    pub fn log_completed(&self) {
        let payload = self.payload.clone().unwrap_or(serde_json::Value::Null);
        let result = self.result.clone().unwrap_or(serde_json::Value::Null);
        tracing::info!(
            transaction_id = %self.transaction_id,
            action = %self.action,
            payload = %payload,
            result = %result,
            "Activity completed"
        );
    }

    /// Emit the failure event with the error attached.
    pub fn log_failed(&self, error: &dyn std::fmt::Display) {
        let payload = self.payload.clone().unwrap_or(serde_json::Value::Null);
        tracing::error!(
            transaction_id = %self.transaction_id,
            action = %self.action,
            payload = %payload,
            error = %error,
            "Activity failed"
        );
    }
}
