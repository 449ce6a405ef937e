use crate::error::{AppError, Result};
use crate::observability::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Remote key-value store holding idempotency records.
///
/// Every operation is a single store command. Implementations do not retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Creates `key` with `value` and `ttl` only if it does not exist yet.
    /// Returns true when this call created the key.
    async fn try_create(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Replaces the value of `key`, keeping its remaining time-to-live.
    async fn overwrite(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Reads the value of `key`; `AppError::NotFound` if absent or expired.
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
}

/// Redis-backed record store.
#[derive(Clone)]
pub struct RedisRecordStore {
    client: redis::Client,
}

impl RedisRecordStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }

    /// Remaining time-to-live of `key`, `None` if it has no expiry or does not exist.
    pub async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection().await?;
        let millis: i64 = conn.pttl(key).await.map_err(AppError::Redis)?;
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }
}

fn record_operation<T>(operation: &str, timer: &LatencyTimer, result: &Result<T>) {
    get_metrics().record_store_operation(operation, timer.elapsed_ms(), result.is_ok());
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn try_create(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let timer = LatencyTimer::new();
        let result: Result<bool> = async {
            let mut conn = self.connection().await?;
            let reply: Option<String> = conn
                .set_options(
                    key,
                    value,
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::EX(ttl.as_secs().max(1) as usize)),
                )
                .await
                .map_err(AppError::Redis)?;

            Ok(reply.is_some())
        }
        .await;

        record_operation("try_create", &timer, &result);
        result
    }

    async fn overwrite(&self, key: &str, value: &[u8]) -> Result<()> {
        let timer = LatencyTimer::new();
        let result: Result<()> = async {
            let mut conn = self.connection().await?;
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("KEEPTTL")
                .query_async(&mut conn)
                .await
                .map_err(AppError::Redis)?;

            Ok(())
        }
        .await;

        record_operation("overwrite", &timer, &result);
        result
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let timer = LatencyTimer::new();
        let result: Result<Vec<u8>> = async {
            let mut conn = self.connection().await?;
            let value: Option<Vec<u8>> = conn.get(key).await.map_err(AppError::Redis)?;
            value.ok_or_else(|| AppError::NotFound(key.to_string()))
        }
        .await;

        record_operation("read", &timer, &result);
        result
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Single-process record store for tests and local development.
///
/// Expired entries are dropped lazily on access.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn try_create(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let stored = StoredValue {
            value: value.to_vec(),
            expires_at: Some(now + ttl),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_expired(now) {
                    existing.insert(stored);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(stored);
                Ok(true)
            }
        }
    }

    async fn overwrite(&self, key: &str, value: &[u8]) -> Result<()> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut existing) if !existing.get().is_expired(now) => {
                existing.get_mut().value = value.to_vec();
            }
            // Same as SET KEEPTTL on a missing key: stored without expiry.
            Entry::Occupied(mut existing) => {
                existing.insert(StoredValue {
                    value: value.to_vec(),
                    expires_at: None,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredValue {
                    value: value.to_vec(),
                    expires_at: None,
                });
            }
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Err(AppError::NotFound(key.to_string()))
    }
}
