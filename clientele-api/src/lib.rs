//! Clientele API - HTTP Layer and Process Wiring
//!
//! Axum routes over [`ClientService`](clientele_domain::ClientService), the
//! Postgres identity store, environment configuration and driver selection
//! used by the `clientele` binary.

pub mod config;
pub mod db;
pub mod drivers;
pub mod error;
pub mod jwt;
pub mod middleware;
pub mod resources;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use config::{
    AppConfig, AppMode, AuthDriver, CacheConfig, DriverConfig, MessageConfig, ServerConfig,
    WorkflowConfig,
};
pub use db::{DbConfig, PostgresIdentityStore};
pub use drivers::Backends;
pub use error::{ApiError, ApiResponse, ApiResult, ErrorCode};
pub use jwt::{HttpJwks, JwksSource, JwtError, JwtValidator, StaticJwks};
pub use routes::create_router;
pub use state::AppState;
