//! JWT Client Authentication
//!
//! Alternative `/v1/*` guard selected by `AUTH_DRIVER=jwt`: instead of
//! looking the bearer token up as a client key, it is validated as an
//! RSA-signed JWT against a JSON Web Key Set.
//!
//! A token is accepted when:
//! - its header names an RSA algorithm (`RS256`, `RS384`, `RS512`) and a `kid`
//! - the key set holds an RSA key with that `kid`
//! - the signature verifies with that key
//! - it carries `exp` in the future, and `nbf` (when present) in the past
//!
//! The key set is fetched for every validation, so rotated keys apply at once.

use async_trait::async_trait;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on one key set fetch.
pub const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a token was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JwtError {
    #[error("unexpected signing method: {0:?}")]
    UnsupportedAlgorithm(Algorithm),

    #[error("kid not found in token header")]
    MissingKid,

    #[error("key with kid {0} not found in JWKS")]
    UnknownKid(String),

    #[error("unsupported key type for kid {0}")]
    UnsupportedKeyType(String),

    #[error("failed to fetch JWKS: {0}")]
    KeySet(String),

    #[error("failed to parse/validate token: {0}")]
    Invalid(String),
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Invalid(err.to_string())
    }
}

// ============================================================================
// KEY SOURCES
// ============================================================================

/// Where the verification keys come from.
#[async_trait]
pub trait JwksSource: Send + Sync {
    async fn key_set(&self) -> Result<JwkSet, JwtError>;
}

/// Key set served over HTTP, e.g. an identity provider's `jwks_uri`.
#[derive(Debug, Clone)]
pub struct HttpJwks {
    url: String,
    client: reqwest::Client,
}

impl HttpJwks {
    pub fn new(url: impl Into<String>) -> Result<Self, JwtError> {
        let client = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .map_err(|e| JwtError::KeySet(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl JwksSource for HttpJwks {
    async fn key_set(&self) -> Result<JwkSet, JwtError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| JwtError::KeySet(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JwtError::KeySet(format!(
                "JWKS endpoint returned status {}",
                status.as_u16()
            )));
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| JwtError::KeySet(format!("failed to decode JWKS: {}", e)))
    }
}

/// Fixed key set held in memory.
#[derive(Debug, Clone)]
pub struct StaticJwks(pub JwkSet);

#[async_trait]
impl JwksSource for StaticJwks {
    async fn key_set(&self) -> Result<JwkSet, JwtError> {
        Ok(self.0.clone())
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

#[derive(Clone)]
pub struct JwtValidator {
    source: Arc<dyn JwksSource>,
}

impl JwtValidator {
    pub fn new(source: Arc<dyn JwksSource>) -> Self {
        Self { source }
    }

    pub fn from_url(url: impl Into<String>) -> Result<Self, JwtError> {
        Ok(Self::new(Arc::new(HttpJwks::new(url)?)))
    }

    /// Validate `token`, returning its claims.
    pub async fn validate(&self, token: &str) -> Result<serde_json::Value, JwtError> {
        let header = decode_header(token)?;
        if !matches!(
            header.alg,
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512
        ) {
            return Err(JwtError::UnsupportedAlgorithm(header.alg));
        }
        let kid = header.kid.ok_or(JwtError::MissingKid)?;

        let key_set = self.source.key_set().await?;
        let jwk = key_set
            .find(&kid)
            .ok_or_else(|| JwtError::UnknownKid(kid.clone()))?;
        let key = match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)?,
            _ => return Err(JwtError::UnsupportedKeyType(kid)),
        };

        let mut validation = Validation::new(header.alg);
        validation.set_required_spec_claims(&["exp"]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        let data = decode::<serde_json::Value>(token, &key, &validation)?;
        Ok(data.claims)
    }
}
