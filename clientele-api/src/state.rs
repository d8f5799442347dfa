//! Shared application state for Axum routers.

use crate::jwt::JwtValidator;
use clientele_domain::ClientService;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub service: ClientService,
    /// Bearer secret for `/internal/*`. `None` locks those routes.
    pub internal_key: Option<Arc<SecretString>>,
    pub ping_sample: Duration,
    /// Verifies `/v1/*` tokens as JWTs when set; otherwise they are looked
    /// up as client bearer keys.
    pub jwt: Option<JwtValidator>,
}

impl AppState {
    pub fn new(service: ClientService) -> Self {
        Self {
            service,
            internal_key: None,
            ping_sample: Duration::from_millis(1000),
            jwt: None,
        }
    }

    pub fn with_internal_key(mut self, key: SecretString) -> Self {
        self.internal_key = Some(Arc::new(key));
        self
    }

    pub fn with_ping_sample(mut self, sample: Duration) -> Self {
        self.ping_sample = sample;
        self
    }

    pub fn with_jwt_validator(mut self, validator: JwtValidator) -> Self {
        self.jwt = Some(validator);
        self
    }
}
