//! Client identity record, write input and query filter.

use crate::{
    ClienteleResult, Timestamp, ValidationError, BEARER_KEY_BYTES, MAX_BEARER_KEY_LEN,
    MAX_NAME_LEN,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Store-assigned surrogate key.
pub type ClientId = i64;

// ============================================================================
// RECORD
// ============================================================================

/// A persisted client. `bearer_key` is the natural key and the only
/// credential the client presents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: ClientId,
    pub name: String,
    pub bearer_key: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ============================================================================
// INPUT
// ============================================================================

/// Write input for an upsert. An empty `bearer_key` asks for a generated one.
/// Timestamps supplied by callers are overwritten by [`ClientInput::prepare`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientInput {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bearer_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
}

impl ClientInput {
    /// Input carrying only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_bearer_key(mut self, bearer_key: impl Into<String>) -> Self {
        self.bearer_key = bearer_key.into();
        self
    }

    /// Fill in a bearer key when missing and stamp both timestamps with `now`.
    ///
    /// `created_at` is stamped even when the row already exists; the store
    /// only overwrites `name` and `updated_at` on conflict, so the stamped
    /// value matters for new rows alone.
    pub fn prepare(&mut self, now: Timestamp) {
        if self.bearer_key.is_empty() {
            self.bearer_key = generate_bearer_key();
        }
        self.created_at = Some(now);
        self.updated_at = Some(now);
    }

    /// Check column limits.
    pub fn validate(&self) -> ClienteleResult<()> {
        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(ValidationError::InvalidValue {
                field: "name".to_string(),
                reason: format!("longer than {} characters", MAX_NAME_LEN),
            }
            .into());
        }
        if self.bearer_key.len() > MAX_BEARER_KEY_LEN {
            return Err(ValidationError::InvalidValue {
                field: "bearer_key".to_string(),
                reason: format!("longer than {} bytes", MAX_BEARER_KEY_LEN),
            }
            .into());
        }
        Ok(())
    }
}

/// Generate a fresh bearer key: [`BEARER_KEY_BYTES`] bytes from the thread
/// CSPRNG, hex-encoded.
pub fn generate_bearer_key() -> String {
    let mut bytes = [0u8; BEARER_KEY_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ============================================================================
// FILTER
// ============================================================================

/// Selection over clients. Values within one field are OR-ed, set fields are
/// AND-ed. A filter with no field set is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientFilter {
    #[serde(default)]
    pub ids: Vec<i64>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub bearer_keys: Vec<String>,
}

impl ClientFilter {
    pub fn by_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn by_names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn by_bearer_key(bearer_key: impl Into<String>) -> Self {
        Self {
            bearer_keys: vec![bearer_key.into()],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.names.is_empty() && self.bearer_keys.is_empty()
    }

    /// Reject the all-empty filter.
    pub fn validate(&self) -> ClienteleResult<()> {
        if self.is_empty() {
            return Err(ValidationError::InvalidFilter.into());
        }
        Ok(())
    }

    /// Whether `record` satisfies every set field.
    pub fn matches(&self, record: &ClientRecord) -> bool {
        (self.ids.is_empty() || self.ids.contains(&record.id))
            && (self.names.is_empty() || self.names.iter().any(|n| *n == record.name))
            && (self.bearer_keys.is_empty()
                || self.bearer_keys.iter().any(|k| *k == record.bearer_key))
    }
}

// =============================================================================
// TESTS
// =============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_filter_by_key_matches_only_that_key(
            key in "[a-f0-9]{1,50}",
            other in "[a-f0-9]{1,50}",
        ) {
            let now = chrono::Utc::now();
            let rec = ClientRecord {
                id: 1,
                name: "n".to_string(),
                bearer_key: other.clone(),
                created_at: now,
                updated_at: now,
            };
            prop_assert_eq!(ClientFilter::by_bearer_key(key.clone()).matches(&rec), key == other);
        }

        #[test]
        fn prop_non_empty_filter_validates(ids in proptest::collection::vec(any::<i64>(), 1..5)) {
            prop_assert!(ClientFilter::by_ids(ids).validate().is_ok());
        }
    }
}
