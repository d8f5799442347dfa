//! Well-known names and limits shared by producers and consumers.

use std::time::Duration;

/// Routing key for upsert batches published on the broker.
pub const UPSERT_CLIENT_TOPIC: &str = "client.upsert";

/// Workflow type name; also used as the task queue name.
pub const UPSERT_CLIENT_WORKFLOW: &str = "UpsertClientWorkflow";

/// Activity name recorded for the single step of the upsert workflow.
pub const UPSERT_CLIENT_ACTIVITY: &str = "UpsertClientActivity";

/// Lifetime of a lookup cache entry.
pub const LOOKUP_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Start-to-close timeout for one upsert activity attempt.
pub const UPSERT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Random bytes drawn for a generated bearer key (hex doubles the length).
pub const BEARER_KEY_BYTES: usize = 25;

/// Column limit on `clients.name`.
pub const MAX_NAME_LEN: usize = 100;

/// Column limit on `clients.bearer_key`.
pub const MAX_BEARER_KEY_LEN: usize = 255;
