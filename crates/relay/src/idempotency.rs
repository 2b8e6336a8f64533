// Idempotency key middleware for mutating POST requests.
//
// Extracts the `Idempotency-Key` header and checks an in-memory store for
// duplicate requests. Keys are scoped to the request path. Returns cached
// responses for matching keys, errors on payload hash mismatch, and stores
// new non-5xx responses for the TTL.

use axum::{
    body::{to_bytes, Body, Bytes},
    http::{HeaderValue, Request, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::error::{ErrorCode, RelayError};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum body size buffered for hashing (1 MiB).
const MAX_HASH_BODY_BYTES: usize = 1024 * 1024;

/// In-memory idempotency key store.
#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    entries: Arc<RwLock<HashMap<String, IdempotencyEntry>>>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct IdempotencyEntry {
    body_hash: String,
    status: StatusCode,
    body: Bytes,
    created_at: Instant,
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())), ttl: DEFAULT_TTL }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    async fn get(&self, key: &str) -> Option<IdempotencyEntry> {
        let guard = self.entries.read().await;
        guard.get(key).filter(|entry| entry.created_at.elapsed() < self.ttl).cloned()
    }

    async fn insert(&self, key: String, entry: IdempotencyEntry) {
        self.entries.write().await.insert(key, entry);
    }

    /// Remove expired entries. Returns how many were dropped.
    pub async fn evict_expired(&self) -> usize {
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        before - guard.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Axum middleware for idempotency key enforcement.
///
/// Only POST requests carrying the header and an [`IdempotencyStore`]
/// extension are affected; everything else passes through unchanged.
pub async fn idempotency_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    if request.method() != axum::http::Method::POST {
        return next.run(request).await;
    }

    let key = match request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(key) => key.to_owned(),
        None => return next.run(request).await,
    };

    let store = match request.extensions().get::<IdempotencyStore>() {
        Some(store) => store.clone(),
        None => return next.run(request).await,
    };

    let scoped_key = format!("{}\n{key}", request.uri().path());

    let (parts, body) = request.into_parts();
    let body_bytes = match to_bytes(body, MAX_HASH_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return RelayError::new(
                ErrorCode::ValidationFailed,
                "request body too large for idempotency check",
            )
            .into_response();
        }
    };
    let body_hash = hash_body(&body_bytes);

    if let Some(entry) = store.get(&scoped_key).await {
        if entry.body_hash == body_hash {
            return Response::builder()
                .status(entry.status)
                .header("content-type", "application/json")
                .header(IDEMPOTENCY_KEY_HEADER, &key)
                .header("idempotency-replay", "true")
                .body(Body::from(entry.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
        return RelayError::from_code(ErrorCode::IdempotencyConflict)
            .with_details(json!({ "idempotency_key": key }))
            .into_response();
    }

    let request = Request::from_parts(parts, Body::from(body_bytes));
    let response = next.run(request).await;

    let (resp_parts, resp_body) = response.into_parts();
    let resp_bytes = to_bytes(resp_body, MAX_HASH_BODY_BYTES).await.unwrap_or_default();

    // Server errors stay retryable under the same key.
    if !resp_parts.status.is_server_error() {
        store
            .insert(
                scoped_key,
                IdempotencyEntry {
                    body_hash,
                    status: resp_parts.status,
                    body: resp_bytes.clone(),
                    created_at: Instant::now(),
                },
            )
            .await;
    }

    let mut response = Response::from_parts(resp_parts, Body::from(resp_bytes));
    if let Ok(header) = HeaderValue::from_str(&key) {
        response.headers_mut().insert(IDEMPOTENCY_KEY_HEADER, header);
    }
    response
}

fn hash_body(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Extension, Router};
    use tower::ServiceExt;

    async fn echo_handler(body: String) -> impl IntoResponse {
        body
    }

    async fn failing_handler() -> impl IntoResponse {
        StatusCode::SERVICE_UNAVAILABLE
    }

    fn test_app(store: IdempotencyStore) -> Router {
        Router::new()
            .route("/create", post(echo_handler))
            .route("/other", post(echo_handler))
            .route("/flaky", post(failing_handler))
            .layer(axum::middleware::from_fn(idempotency_middleware))
            .layer(Extension(store))
    }

    fn post_request(uri: &str, key: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(axum::http::Method::POST)
            .uri(uri)
            .header(IDEMPOTENCY_KEY_HEADER, key)
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_request_returns_cached_response() {
        let store = IdempotencyStore::new();

        let first = test_app(store.clone()).oneshot(post_request("/create", "k", "data")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers().get(IDEMPOTENCY_KEY_HEADER).unwrap(), "k");

        let second =
            test_app(store.clone()).oneshot(post_request("/create", "k", "data")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers().get("idempotency-replay").unwrap(), "true");
        let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"data");
    }

    #[tokio::test]
    async fn different_body_same_key_returns_conflict() {
        let store = IdempotencyStore::new();

        let _ = test_app(store.clone()).oneshot(post_request("/create", "k", "a")).await.unwrap();
        let second = test_app(store).oneshot(post_request("/create", "k", "b")).await.unwrap();

        assert_eq!(second.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn keys_are_scoped_to_path() {
        let store = IdempotencyStore::new();

        let _ = test_app(store.clone()).oneshot(post_request("/create", "k", "a")).await.unwrap();
        let other = test_app(store.clone()).oneshot(post_request("/other", "k", "b")).await.unwrap();

        assert_eq!(other.status(), StatusCode::OK);
        assert!(other.headers().get("idempotency-replay").is_none());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn server_errors_are_not_cached() {
        let store = IdempotencyStore::new();

        let response = test_app(store.clone()).oneshot(post_request("/flaky", "k", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn no_header_passes_through() {
        let store = IdempotencyStore::new();
        let request = Request::builder()
            .method(axum::http::Method::POST)
            .uri("/create")
            .body(Body::from("no key"))
            .unwrap();

        let response = test_app(store.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn expired_entries_are_evicted() {
        let store = IdempotencyStore::new().with_ttl(Duration::from_millis(1));

        let _ = test_app(store.clone()).oneshot(post_request("/create", "k", "data")).await.unwrap();
        assert_eq!(store.len().await, 1);

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.evict_expired().await, 1);
        assert_eq!(store.len().await, 0);
    }

    #[test]
    fn hash_body_is_deterministic() {
        assert_eq!(hash_body(b"test data"), hash_body(b"test data"));
        assert_ne!(hash_body(b"data-a"), hash_body(b"data-b"));
    }
}
