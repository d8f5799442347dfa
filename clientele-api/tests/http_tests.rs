//! HTTP Router Tests
//!
//! Drives the full router with `tower::ServiceExt::oneshot` over in-memory
//! backends: internal-key, client-key and JWT authentication, the envelope
//! shape of successes and failures, and the CRUD chain.

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Method, Request, StatusCode},
    Router,
};
use clientele_api::{create_router, AppState, Backends, JwtValidator, StaticJwks};
use clientele_core::{BEARER_KEY_BYTES, MAX_NAME_LEN};
use clientele_storage::{IdentityStore, LookupCache};
use clientele_test_utils::{FailingCache, FlakyStore, InMemoryIdentityStore};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use proptest::prelude::*;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const INTERNAL_KEY: &str = "internal-test-key";

// ============================================================================
// TEST HARNESS
// ============================================================================

fn app_over(backends: &Backends) -> Router {
    let state = AppState::new(backends.service())
        .with_internal_key(SecretString::from(INTERNAL_KEY.to_string()))
        .with_ping_sample(Duration::from_millis(5));
    create_router(state)
}

fn test_app() -> Router {
    app_over(&Backends::in_memory())
}

fn json_request(method: Method, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

// ============================================================================
// INTERNAL ROUTES
// ============================================================================

#[tokio::test]
async fn test_internal_routes_require_internal_key() {
    let app = test_app();
    let filter = json!({"names": ["Acme"]});

    for token in [None, Some("wrong-key"), Some("")] {
        let (status, body) = send(
            &app,
            json_request(Method::POST, "/internal/client-find", token, filter.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "token {:?}", token);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("Unauthorized"));
        assert_eq!(body["code"], json!("UNAUTHORIZED"));
    }
}

#[tokio::test]
async fn test_internal_routes_locked_without_configured_key() {
    let app = create_router(AppState::new(Backends::in_memory().service()));
    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/internal/client-find",
            Some(INTERNAL_KEY),
            json!({"names": ["Acme"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_upsert_find_delete_chain() {
    let app = test_app();

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/internal/client-upsert",
            Some(INTERNAL_KEY),
            json!([{"name": "Acme", "bearer_key": "acme-key"}, {"name": "Globex"}]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    let records = body["data"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    let acme = records.iter().find(|r| r["name"] == "Acme").unwrap();
    assert_eq!(acme["bearer_key"], json!("acme-key"));
    let globex = records.iter().find(|r| r["name"] == "Globex").unwrap();
    assert_eq!(
        globex["bearer_key"].as_str().unwrap().len(),
        BEARER_KEY_BYTES * 2
    );

    // Rename by key keeps the id.
    let (_, body) = send(
        &app,
        json_request(
            Method::POST,
            "/internal/client-upsert",
            Some(INTERNAL_KEY),
            json!([{"name": "Acme Corp", "bearer_key": "acme-key"}]),
        ),
    )
    .await;
    assert_eq!(body["data"][0]["id"], acme["id"]);
    assert_eq!(body["data"][0]["name"], json!("Acme Corp"));

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/internal/client-find",
            Some(INTERNAL_KEY),
            json!({"bearer_keys": ["acme-key"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["name"], json!("Acme Corp"));

    let (status, body) = send(
        &app,
        json_request(
            Method::DELETE,
            "/internal/client-delete",
            Some(INTERNAL_KEY),
            json!({"ids": [acme["id"]]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true}));

    let (_, body) = send(
        &app,
        json_request(
            Method::POST,
            "/internal/client-find",
            Some(INTERNAL_KEY),
            json!({"bearer_keys": ["acme-key"]}),
        ),
    )
    .await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let app = test_app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/internal/client-upsert")
        .header("content-type", "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", INTERNAL_KEY))
        .body(Body::from("{not json"))
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["code"], json!("MALFORMED_BODY"));
    assert!(body.get("data").is_none());
}

#[tokio::test]
async fn test_invalid_input_is_bad_request() {
    let app = test_app();

    let (status, body) = send(
        &app,
        json_request(Method::POST, "/internal/client-find", Some(INTERNAL_KEY), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("INVALID_INPUT"));

    let (status, body) = send(
        &app,
        json_request(Method::POST, "/internal/client-upsert", Some(INTERNAL_KEY), json!([])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));

    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/internal/client-upsert",
            Some(INTERNAL_KEY),
            json!([{"name": "x".repeat(MAX_NAME_LEN + 1)}]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// CLIENT ROUTES
// ============================================================================

#[tokio::test]
async fn test_ping_requires_known_client_key() {
    let app = test_app();

    let (status, _) = send(&app, get_request("/v1/ping", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, get_request("/v1/ping", Some("nobody"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn test_ping_with_registered_client() {
    let app = test_app();
    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/internal/client-upsert",
            Some(INTERNAL_KEY),
            json!([{"name": "Acme", "bearer_key": "acme-key"}]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // First call loads from the store, second from the cache.
    for _ in 0..2 {
        let (status, body) = send(&app, get_request("/v1/ping", Some("acme-key"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], json!("pong"));
        assert_eq!(body["cpu"].as_array().unwrap().len(), 1);
        assert_eq!(body["memory"].as_array().unwrap().len(), 1);
        assert!(body["core"][0]["core"].as_str().unwrap().ends_with(" Core"));
    }
}

#[tokio::test]
async fn test_resolver_failure_is_server_error_not_unauthorized() {
    let store: Arc<dyn IdentityStore> = Arc::new(InMemoryIdentityStore::new());
    let cache: Arc<dyn LookupCache> = Arc::new(FailingCache);
    let app = app_over(&Backends::with_store(store, cache));

    let (status, body) = send(&app, get_request("/v1/ping", Some("acme-key"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], json!(false));
    assert!(body["error"].as_str().unwrap().contains("injected cache outage"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let app = test_app();
    let (status, _) = send(&app, get_request("/v2/ping", Some("acme-key"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// JWT CLIENT AUTH
// ============================================================================

const SIGNING_KEY: &str = include_str!("fixtures/jwt_signing_key.pem");
const KEY_SET: &str = include_str!("fixtures/jwks.json");

fn signed_token(kid: &str, exp_offset: i64) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let claims = json!({ "sub": "acme", "exp": chrono::Utc::now().timestamp() + exp_offset });
    encode(
        &header,
        &claims,
        &EncodingKey::from_rsa_pem(SIGNING_KEY.as_bytes()).unwrap(),
    )
    .unwrap()
}

fn jwt_app(validator: JwtValidator) -> (Router, FlakyStore) {
    let store = FlakyStore::new();
    let backends = Backends::with_store(
        Arc::new(store.clone()),
        Arc::new(clientele_test_utils::InMemoryLookupCache::new()),
    );
    let state = AppState::new(backends.service())
        .with_ping_sample(Duration::from_millis(5))
        .with_jwt_validator(validator);
    (create_router(state), store)
}

fn static_validator() -> JwtValidator {
    let set: JwkSet = serde_json::from_str(KEY_SET).unwrap();
    JwtValidator::new(Arc::new(StaticJwks(set)))
}

#[tokio::test]
async fn test_jwt_driver_accepts_signed_token_without_store_lookup() {
    let (app, store) = jwt_app(static_validator());

    let token = signed_token("clientele-test", 600);
    let (status, body) = send(&app, get_request("/v1/ping", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], json!("pong"));
    assert_eq!(store.calls().total(), 0);
}

#[tokio::test]
async fn test_jwt_driver_rejects_with_reason() {
    let (app, store) = jwt_app(static_validator());

    let expired = signed_token("clientele-test", -60);
    let (status, body) = send(&app, get_request("/v1/ping", Some(&expired))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], json!(false));
    assert!(body["error"].as_str().unwrap().starts_with("Unauthorized: "));

    let unknown = signed_token("other-key", 600);
    let (status, body) = send(&app, get_request("/v1/ping", Some(&unknown))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("other-key"));

    // A plain bearer key is not a JWT.
    let (status, _) = send(&app, get_request("/v1/ping", Some("acme-key"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(store.calls().total(), 0);
}

#[tokio::test]
async fn test_jwt_driver_fetches_key_set_over_http() {
    let jwks = Router::new().route(
        "/jwks",
        axum::routing::get(|| async {
            (
                [("content-type", "application/json")],
                KEY_SET,
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { axum::serve(listener, jwks).await });

    let validator = JwtValidator::from_url(format!("http://{}/jwks", addr)).unwrap();
    let (app, _) = jwt_app(validator);
    let (status, _) = send(
        &app,
        get_request("/v1/ping", Some(&signed_token("clientele-test", 600))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let unreachable = JwtValidator::from_url(format!("http://{}/missing", addr)).unwrap();
    let (app, _) = jwt_app(unreachable);
    let (status, body) = send(
        &app,
        get_request("/v1/ping", Some(&signed_token("clientele-test", 600))),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("status 404"));

    server.abort();
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Any bearer token other than the internal key is rejected with 401
    /// before the handler runs.
    #[test]
    fn prop_internal_key_enforced(token in "[A-Za-z0-9._-]{0,40}") {
        prop_assume!(token != INTERNAL_KEY);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let app = test_app();
            let (status, body) = send(
                &app,
                json_request(
                    Method::POST,
                    "/internal/client-find",
                    Some(&token),
                    json!({"names": ["Acme"]}),
                ),
            )
            .await;

            prop_assert_eq!(status, StatusCode::UNAUTHORIZED);
            prop_assert_eq!(&body["success"], &json!(false));
            Ok(())
        })?;
    }
}
