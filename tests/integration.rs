//! Integration tests for the secure client and typed API wrapper.
//!
//! These tests verify:
//! 1. CSRF token lifecycle: fetch-on-demand, in-session reuse, expiry
//!    refetch, durable persistence across client instances
//! 2. CSRF header attachment rules per HTTP method
//! 3. Typed wrapper contracts: JSON bodies, error normalization, uploads
//! 4. Rate-limit records are per-endpoint and exposed to callers
//!
//! All network behavior is mocked with wiremock; no real backend needed.

use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{header, header_exists, header_regex, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use inventoscan_client::{Api, ClientConfig, Error, SecureClient};

fn token_mock(token: &str, expires_in: u64) -> Mock {
    Mock::given(method("GET"))
        .and(path("/api/csrf-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "csrf_token": token,
            "expires_in": expires_in,
        })))
}

fn config(server: &MockServer) -> ClientConfig {
    ClientConfig::new(server.uri())
        .base_backoff_ms(50)
        .timeout(Duration::from_secs(5))
}

fn api(server: &MockServer) -> Api {
    Api::new(SecureClient::new(config(server)))
}

// ── CSRF token lifecycle ──────────────────────────────────────

/// Two mutating calls within the expiry window share one token fetch.
#[tokio::test]
async fn test_token_fetched_once_and_reused() {
    let server = MockServer::start().await;
    token_mock("abc123", 3600).expect(1).mount(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/products"))
        .and(header("X-CSRF-Token", "abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
        .expect(2)
        .mount(&server)
        .await;

    let api = api(&server);
    let _: Value = api.post("/api/products", Some(json!({"name": "Chair"}))).await.unwrap();
    let _: Value = api.post("/api/products", Some(json!({"name": "Desk"}))).await.unwrap();
}

/// An expired token triggers exactly one more fetch.
#[tokio::test]
async fn test_expired_token_refetched() {
    let server = MockServer::start().await;
    token_mock("short-lived", 1).expect(2).mount(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/products"))
        .and(header_exists("X-CSRF-Token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
        .expect(2)
        .mount(&server)
        .await;

    let api = api(&server);
    let _: Value = api.post("/api/products", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let _: Value = api.post("/api/products", None).await.unwrap();
}

/// A persisted token survives a client restart; the second instance makes
/// no token fetch of its own.
#[tokio::test]
async fn test_token_persisted_across_instances() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("csrf_token.json");

    token_mock("durable", 3600).expect(1).mount(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/products"))
        .and(header("X-CSRF-Token", "durable"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
        .expect(2)
        .mount(&server)
        .await;

    let first = Api::new(SecureClient::new(
        config(&server).token_store_path(&store_path),
    ));
    let _: Value = first.post("/api/products", None).await.unwrap();
    drop(first);

    let second = Api::new(SecureClient::new(
        config(&server).token_store_path(&store_path),
    ));
    let _: Value = second.post("/api/products", None).await.unwrap();
}

/// With the dev fallback enabled and no token endpoint, mutating calls
/// carry a session-local placeholder instead of failing.
#[tokio::test]
async fn test_dev_fallback_placeholder_token() {
    let server = MockServer::start().await;
    // no token endpoint mounted: the fetch gets a 404
    Mock::given(method("POST"))
        .and(path("/api/products"))
        .and(header_regex("X-CSRF-Token", "^dev-token-"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let api = Api::new(SecureClient::new(config(&server).dev_fallback_token(true)));
    let _: Value = api.post("/api/products", None).await.unwrap();
}

/// Without the fallback, an unreachable token endpoint fails the request.
#[tokio::test]
async fn test_token_fetch_failure_surfaces_without_fallback() {
    let server = MockServer::start().await;
    let api = api(&server);
    let err = api.post::<Value>("/api/products", None).await.unwrap_err();
    assert!(matches!(err, Error::TokenFetch(_)), "got {err:?}");
}

// ── CSRF attachment rules ─────────────────────────────────────

/// Safe methods never attach a token and never trigger a token fetch.
#[tokio::test]
async fn test_get_skips_csrf_entirely() {
    let server = MockServer::start().await;
    token_mock("unused", 3600).expect(0).mount(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server);
    let _: Value = api.get("/api/products").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let get = requests
        .iter()
        .find(|r| r.url.path() == "/api/products")
        .unwrap();
    assert!(!get.headers.contains_key("x-csrf-token"));
}

/// DELETE is mutating and carries the token.
#[tokio::test]
async fn test_delete_attaches_csrf() {
    let server = MockServer::start().await;
    token_mock("abc123", 3600).mount(&server).await;
    Mock::given(method("DELETE"))
        .and(path("/api/products/7"))
        .and(header("X-CSRF-Token", "abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"deleted": true})))
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server);
    let resp: Value = api.delete("/api/products/7").await.unwrap();
    assert_eq!(resp["deleted"], true);
}

/// Uploads are always mutating: the token is attached unconditionally.
#[tokio::test]
async fn test_upload_always_attaches_csrf() {
    let server = MockServer::start().await;
    token_mock("abc123", 3600).expect(1).mount(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/upload"))
        .and(header("X-CSRF-Token", "abc123"))
        .and(header_regex("content-type", "^multipart/form-data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"stored": "photo.jpg"})))
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server);
    let resp: Value = api
        .upload("/api/upload", "photo.jpg", vec![0xFF, 0xD8, 0xFF])
        .await
        .unwrap();
    assert_eq!(resp["stored"], "photo.jpg");
}

// ── Typed wrapper contracts ───────────────────────────────────

/// JSON bodies go out with the right content type and come back typed.
#[tokio::test]
async fn test_post_sends_json_body() {
    let server = MockServer::start().await;
    token_mock("abc123", 3600).mount(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/products"))
        .and(header("content-type", "application/json"))
        .and(wiremock::matchers::body_json(json!({"name": "Chair", "qty": 3})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 42, "name": "Chair"})))
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server);
    let created: Value = api
        .post("/api/products", Some(json!({"name": "Chair", "qty": 3})))
        .await
        .unwrap();
    assert_eq!(created["id"], 42);
}

/// Non-2xx responses surface the server's `detail` text and are not retried.
#[tokio::test]
async fn test_application_error_not_retried() {
    let server = MockServer::start().await;
    token_mock("abc123", 3600).mount(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/products"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({"detail": "name required"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server);
    let err = api.post::<Value>("/api/products", None).await.unwrap_err();
    assert_eq!(
        err,
        Error::Api {
            status: 422,
            detail: "name required".into()
        }
    );
}

/// A non-JSON error body falls back to a generic message.
#[tokio::test]
async fn test_error_detail_fallback_for_non_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/products"))
        .respond_with(ResponseTemplate::new(500).set_body_string("<html>oops</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server);
    let err = api.get::<Value>("/api/products").await.unwrap_err();
    assert_eq!(
        err,
        Error::Api {
            status: 500,
            detail: "Request failed with status 500".into()
        }
    );
}

// ── Rate-limit records ────────────────────────────────────────

/// Records are keyed per endpoint and exposed through the client.
#[tokio::test]
async fn test_rate_limit_records_are_per_endpoint() {
    let server = MockServer::start().await;
    let reset = (chrono::Utc::now().timestamp() + 60).to_string();
    Mock::given(method("GET"))
        .and(path("/api/products"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-RateLimit-Limit", "100")
                .insert_header("X-RateLimit-Remaining", "99")
                .insert_header("X-RateLimit-Reset", reset.as_str())
                .set_body_json(json!([])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/drafts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = SecureClient::new(config(&server));
    let api = Api::new(client.clone());
    let _: Value = api.get("/api/products").await.unwrap();
    let _: Value = api.get("/api/drafts").await.unwrap();

    let info = client.rate_limit_status("/api/products").unwrap();
    assert_eq!(info.limit, 100);
    assert_eq!(info.remaining, 99);
    // the endpoint without headers has no record
    assert!(client.rate_limit_status("/api/drafts").is_none());

    client.clear_rate_limits();
    assert!(client.rate_limit_status("/api/products").is_none());
}

/// initialize() warms the token cache so the first mutating call needs no
/// extra fetch, and never fails even with no backend.
#[tokio::test]
async fn test_initialize_warms_token_cache() {
    let server = MockServer::start().await;
    token_mock("warm", 3600).expect(1).mount(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/products"))
        .and(header("X-CSRF-Token", "warm"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let client = SecureClient::new(config(&server));
    client.initialize().await;
    let api = Api::new(client);
    let _: Value = api.post("/api/products", None).await.unwrap();

    // unreachable backend: warm-up is best-effort
    let offline = SecureClient::new(ClientConfig::new("http://127.0.0.1:9"));
    offline.initialize().await;
}
