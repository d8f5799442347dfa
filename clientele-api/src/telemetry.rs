//! Tracing subscriber initialization.
//!
//! `RUST_LOG` drives the filter. Release mode logs JSON lines; debug mode
//! uses the human-readable formatter.

use crate::config::AppMode;
use crate::error::ApiError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "clientele=debug,tower_http=info,info";

pub fn init_tracing(mode: AppMode) -> Result<(), ApiError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match mode {
        AppMode::Release => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        AppMode::Debug => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.map_err(|e| ApiError::internal_error(format!("Failed to init subscriber: {}", e)))?;

    tracing::debug!(mode = ?mode, "Tracing initialized");
    Ok(())
}
