//! Clientele Core - Entity Types
//!
//! Data structures shared by every other crate: the client record, its
//! write input and query filter, the error taxonomy, and the request
//! metadata record used for structured logging.
//! No I/O lives here.

use chrono::{DateTime, Utc};

pub mod activity;
pub mod client;
pub mod constants;
pub mod error;

pub use activity::{mask_secret, Activity};
pub use client::{generate_bearer_key, ClientFilter, ClientId, ClientInput, ClientRecord};
pub use constants::*;
pub use error::{
    CacheError, ClienteleError, ClienteleResult, ConfigError, DeliveryError, StoreError,
    ValidationError,
};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;
