#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use idempotency_layer::idempotency::{Idempotency, IdempotencyConfig, InMemoryRecordStore, RecordStore};
use idempotency_layer::{AppError, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory store that counts calls and can be told to fail.
#[derive(Default)]
pub struct CountingStore {
    pub inner: InMemoryRecordStore,
    pub creates: AtomicUsize,
    pub overwrites: AtomicUsize,
    pub reads: AtomicUsize,
    pub unreachable: AtomicBool,
    pub fail_overwrite: AtomicBool,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn total_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
            + self.overwrites.load(Ordering::SeqCst)
            + self.reads.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AppError::Store("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for CountingStore {
    async fn try_create(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        self.inner.try_create(key, value, ttl).await
    }

    async fn overwrite(&self, key: &str, value: &[u8]) -> Result<()> {
        self.overwrites.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        if self.fail_overwrite.load(Ordering::SeqCst) {
            return Err(AppError::Store("write timed out".to_string()));
        }
        self.inner.overwrite(key, value).await
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        self.inner.read(key).await
    }
}

pub fn test_config() -> IdempotencyConfig {
    IdempotencyConfig {
        poll_interval_ms: 10,
        ..IdempotencyConfig::default()
    }
}

pub fn coordinator(store: Arc<CountingStore>) -> Idempotency {
    Idempotency::new(store, &test_config()).expect("valid test configuration")
}

pub fn post(uri: &str, key: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("x-idempotency-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub async fn body_bytes(body: Body) -> bytes::Bytes {
    axum::body::to_bytes(body, usize::MAX).await.unwrap()
}
