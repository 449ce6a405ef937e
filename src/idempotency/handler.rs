use crate::error::{AppError, Result};
use crate::idempotency::capture::{capture_response, is_connection_takeover, CompletionFuture, OnComplete};
use crate::idempotency::key_extractor::{KeyExtractor, KeyLookup, DEFAULT_KEY_LOOKUP};
use crate::idempotency::record::{record_key, IdempotencyRecord};
use crate::idempotency::storage::RecordStore;
use crate::observability::{get_metrics, mask_sensitive, LatencyTimer};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Raw idempotency settings, as read from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// HTTP methods handled as idempotent. Empty means `POST` only.
    pub methods: Vec<String>,
    /// `header:<name>`, `query:<name>` or `form:<name>`.
    pub key_lookup: String,
    pub ttl_seconds: u64,
    pub poll_interval_ms: u64,
    /// Maximum request body buffered for `form:` lookups.
    pub form_body_limit: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            methods: vec![Method::POST.to_string()],
            key_lookup: DEFAULT_KEY_LOOKUP.to_string(),
            ttl_seconds: 86400, // 24 hours
            poll_interval_ms: 500,
            form_body_limit: 64 * 1024,
        }
    }
}

/// Predicate for requests that bypass idempotency handling entirely.
pub type Skipper = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;

/// Coordinates idempotent execution of requests sharing a key.
///
/// The coordinator keeps no per-key state of its own: the record store's atomic
/// create is the only point where concurrent requests are ordered. Cloning is cheap.
#[derive(Clone)]
pub struct Idempotency {
    store: Arc<dyn RecordStore>,
    methods: Arc<[Method]>,
    extractor: Arc<dyn KeyExtractor>,
    skipper: Option<Skipper>,
    ttl: Duration,
    poll_interval: Duration,
    form_body_limit: usize,
}

impl Idempotency {
    /// Validates `config`. An unusable configuration is rejected here so the
    /// middleware is never installed with it.
    pub fn new(store: Arc<dyn RecordStore>, config: &IdempotencyConfig) -> Result<Self> {
        let methods = if config.methods.is_empty() {
            vec![Method::POST]
        } else {
            config
                .methods
                .iter()
                .map(|m| {
                    Method::from_bytes(m.trim().to_uppercase().as_bytes())
                        .map_err(|_| AppError::Config(format!("invalid method `{}`", m)))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let lookup = if config.key_lookup.is_empty() {
            DEFAULT_KEY_LOOKUP
        } else {
            config.key_lookup.as_str()
        };
        let extractor = KeyLookup::parse(lookup)?;

        if config.ttl_seconds == 0 {
            return Err(AppError::Config("ttl_seconds must be positive".to_string()));
        }
        if config.poll_interval_ms == 0 {
            return Err(AppError::Config("poll_interval_ms must be positive".to_string()));
        }

        Ok(Self {
            store,
            methods: methods.into(),
            extractor: Arc::new(extractor),
            skipper: None,
            ttl: Duration::from_secs(config.ttl_seconds),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            form_body_limit: config.form_body_limit,
        })
    }

    pub fn with_skipper<F>(mut self, skipper: F) -> Self
    where
        F: Fn(&Parts) -> bool + Send + Sync + 'static,
    {
        self.skipper = Some(Arc::new(skipper));
        self
    }

    /// Replaces the configured lookup with a custom extraction strategy.
    pub fn with_key_extractor<E>(mut self, extractor: E) -> Self
    where
        E: KeyExtractor + 'static,
    {
        self.extractor = Arc::new(extractor);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    fn applies_to(&self, parts: &Parts) -> bool {
        if let Some(skipper) = &self.skipper {
            if skipper(parts) {
                return false;
            }
        }
        self.methods.contains(&parts.method)
    }

    /// Runs `request` through the idempotency protocol, calling `next` at most
    /// once per key across every instance sharing the store.
    pub async fn handle<F, Fut>(&self, request: Request, next: F) -> Result<Response>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let metrics = get_metrics();
        let (parts, body) = request.into_parts();

        if !self.applies_to(&parts) {
            metrics.record_request_outcome("passthrough");
            return Ok(next(Request::from_parts(parts, body)).await);
        }

        let (key, body) = self.resolve_key(&parts, body).await?;
        let request = Request::from_parts(parts, body);

        let Some(key) = key else {
            metrics.record_request_outcome("passthrough");
            return Ok(next(request).await);
        };

        let result = self.coordinate(&key, request, next).await;
        if let Err(e) = &result {
            metrics.record_request_outcome("failed");
            tracing::warn!(key = %mask_sensitive(&key, 4), "Idempotent request failed: {}", e);
        }
        result
    }

    async fn resolve_key(&self, parts: &Parts, body: Body) -> Result<(Option<String>, Body)> {
        if !self.extractor.needs_body() {
            let key = self.extractor.extract(parts, &Bytes::new())?;
            return Ok((key, body));
        }

        let bytes = axum::body::to_bytes(body, self.form_body_limit)
            .await
            .map_err(|e| AppError::Extraction(format!("failed to read request body: {}", e)))?;
        let key = self.extractor.extract(parts, &bytes)?;
        Ok((key, Body::from(bytes)))
    }

    async fn coordinate<F, Fut>(&self, key: &str, request: Request, next: F) -> Result<Response>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let storage_key = record_key(key);
        let pending = IdempotencyRecord::pending().to_bytes()?;

        if self.store.try_create(&storage_key, &pending, self.ttl).await? {
            tracing::info!(key = %mask_sensitive(key, 4), "Executing idempotent request");
            self.execute(storage_key, request, next).await
        } else {
            tracing::info!(
                key = %mask_sensitive(key, 4),
                "Duplicate idempotent request, waiting for the original response"
            );
            let cancellation = request.extensions().get::<CancellationToken>().cloned();
            self.wait_for_completion(&storage_key, cancellation).await
        }
    }

    async fn execute<F, Fut>(&self, storage_key: String, request: Request, next: F) -> Result<Response>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let response = next(request).await;
        let store = Arc::clone(&self.store);

        if is_connection_takeover(&response) {
            persist(store, storage_key, response.status(), response.headers(), &[]).await?;
            return Ok(response);
        }

        let status = response.status();
        let headers = response.headers().clone();
        let on_complete: OnComplete = Box::new(move |body: Bytes| {
            Box::pin(async move { persist(store, storage_key, status, &headers, &body).await })
                as CompletionFuture
        });

        Ok(capture_response(response, on_complete))
    }

    async fn wait_for_completion(
        &self,
        storage_key: &str,
        cancellation: Option<CancellationToken>,
    ) -> Result<Response> {
        let metrics = get_metrics();
        let timer = LatencyTimer::new();

        loop {
            let raw = self.store.read(storage_key).await?;
            let record = IdempotencyRecord::from_slice(&raw)?;

            if record.is_done() {
                metrics.record_request_outcome("replayed");
                metrics.record_wait_latency(timer.elapsed_ms());
                return record.into_response();
            }

            metrics.record_poll();
            tokio::select! {
                _ = cancelled(cancellation.as_ref()) => {
                    metrics.record_request_outcome("cancelled");
                    return Err(AppError::Cancelled);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

async fn persist(
    store: Arc<dyn RecordStore>,
    storage_key: String,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<()> {
    let result: Result<()> = async {
        let data = IdempotencyRecord::completed(status, headers, body)?.to_bytes()?;
        store.overwrite(&storage_key, &data).await
    }
    .await;

    match result {
        Ok(()) => {
            get_metrics().record_request_outcome("executed");
            Ok(())
        }
        Err(e) => {
            get_metrics().record_request_outcome("persist_failed");
            tracing::error!(
                key = %mask_sensitive(&storage_key, 4),
                "Failed to persist idempotent response: {}",
                e
            );
            Err(e)
        }
    }
}

/// Axum middleware entry point, for use with `axum::middleware::from_fn_with_state`.
pub async fn idempotency_middleware(
    State(idempotency): State<Idempotency>,
    request: Request,
    next: Next,
) -> Result<Response> {
    idempotency.handle(request, |request| next.run(request)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::storage::MockRecordStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn post_with_key(key: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/orders")
            .header("x-idempotency-key", key)
            .body(Body::empty())
            .unwrap()
    }

    fn coordinator(store: MockRecordStore) -> Idempotency {
        Idempotency::new(Arc::new(store), &IdempotencyConfig::default()).unwrap()
    }

    async fn counted_handler(calls: Arc<AtomicUsize>, request: Request) -> Response {
        let _ = request;
        calls.fetch_add(1, Ordering::SeqCst);
        let mut response = Response::new(Body::from(r#"{"id":1}"#));
        *response.status_mut() = StatusCode::CREATED;
        response
    }

    #[test]
    fn test_default_config() {
        let config = IdempotencyConfig::default();
        assert_eq!(config.methods, vec!["POST"]);
        assert_eq!(config.key_lookup, "header:X-Idempotency-Key");
        assert_eq!(config.ttl_seconds, 86400);
        assert_eq!(config.poll_interval_ms, 500);
    }

    #[test]
    fn test_empty_config_falls_back_to_defaults() {
        let config = IdempotencyConfig {
            methods: Vec::new(),
            key_lookup: String::new(),
            ..Default::default()
        };
        let idempotency = Idempotency::new(Arc::new(MockRecordStore::new()), &config).unwrap();
        assert_eq!(idempotency.methods(), &[Method::POST]);
        assert_eq!(idempotency.ttl(), Duration::from_secs(86400));
        assert_eq!(idempotency.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let unknown_source = IdempotencyConfig {
            key_lookup: "cookie:session".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Idempotency::new(Arc::new(MockRecordStore::new()), &unknown_source),
            Err(AppError::Config(_))
        ));

        let bad_method = IdempotencyConfig {
            methods: vec!["PO ST".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            Idempotency::new(Arc::new(MockRecordStore::new()), &bad_method),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_non_idempotent_method_skips_store() {
        // No expectations: any store call fails the test.
        let idempotency = coordinator(MockRecordStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let request = Request::builder()
            .method(Method::GET)
            .uri("/orders")
            .header("x-idempotency-key", "abc")
            .body(Body::empty())
            .unwrap();
        let c = calls.clone();
        let response = idempotency
            .handle(request, |r| counted_handler(c, r))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skipper_bypasses_coordination() {
        let idempotency = coordinator(MockRecordStore::new())
            .with_skipper(|parts| parts.uri.path().starts_with("/internal"));
        let calls = Arc::new(AtomicUsize::new(0));

        let request = Request::builder()
            .method(Method::POST)
            .uri("/internal/replay")
            .header("x-idempotency-key", "abc")
            .body(Body::empty())
            .unwrap();
        let c = calls.clone();
        idempotency.handle(request, |r| counted_handler(c, r)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_store_failure_at_lock_never_runs_handler() {
        let mut store = MockRecordStore::new();
        store
            .expect_try_create()
            .times(1)
            .returning(|_, _, _| Err(AppError::Store("connection refused".to_string())));
        let idempotency = coordinator(store);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let err = idempotency
            .handle(post_with_key("abc"), |r| counted_handler(c, r))
            .await
            .unwrap_err();

        assert!(err.is_store_error());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lock_uses_namespaced_key_and_ttl() {
        let mut store = MockRecordStore::new();
        store
            .expect_try_create()
            .withf(|key, value, ttl| {
                key == "req::abc"
                    && *ttl == Duration::from_secs(86400)
                    && IdempotencyRecord::from_slice(value).map(|r| !r.done).unwrap_or(false)
            })
            .times(1)
            .returning(|_, _, _| Ok(true));
        store
            .expect_overwrite()
            .withf(|key, value| {
                let record = IdempotencyRecord::from_slice(value).unwrap();
                key == "req::abc" && record.done && record.response_code == 201
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let idempotency = coordinator(store);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let response = idempotency
            .handle(post_with_key("abc"), |r| counted_handler(c, r))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

        assert_eq!(body, Bytes::from_static(br#"{"id":1}"#));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_replays_completed_record() {
        let mut headers = HeaderMap::new();
        headers.insert("x-order-id", "1".parse().unwrap());
        let stored = IdempotencyRecord::completed(StatusCode::CREATED, &headers, br#"{"id":1}"#)
            .unwrap()
            .to_bytes()
            .unwrap();

        let mut store = MockRecordStore::new();
        store.expect_try_create().returning(|_, _, _| Ok(false));
        store
            .expect_read()
            .times(1)
            .returning(move |_| Ok(stored.clone()));
        let idempotency = coordinator(store);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let response = idempotency
            .handle(post_with_key("abc"), |r| counted_handler(c, r))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-order-id"], "1");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_corrupt_record_aborts_wait() {
        let mut store = MockRecordStore::new();
        store.expect_try_create().returning(|_, _, _| Ok(false));
        store
            .expect_read()
            .times(1)
            .returning(|_| Ok(b"{not json".to_vec()));
        let idempotency = coordinator(store);

        let err = idempotency
            .handle(post_with_key("abc"), |_| async { Response::new(Body::empty()) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_upgrade_response_persists_head_only() {
        let mut store = MockRecordStore::new();
        store.expect_try_create().returning(|_, _, _| Ok(true));
        store
            .expect_overwrite()
            .withf(|_, value| {
                let record = IdempotencyRecord::from_slice(value).unwrap();
                record.done && record.response_code == 101 && record.response_body.is_empty()
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let idempotency = coordinator(store);

        let response = idempotency
            .handle(post_with_key("ws"), |_| async {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
                response
            })
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    }
}
