//! Run with `cargo test -- --ignored` against a local Redis (`REDIS_URL` overrides the address).

use idempotency_layer::idempotency::{record_key, RecordStore, RedisRecordStore};
use idempotency_layer::AppError;
use std::time::Duration;
use uuid::Uuid;

fn store() -> RedisRecordStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisRecordStore::new(redis::Client::open(url).unwrap())
}

fn unique_key() -> String {
    record_key(&format!("test-{}", Uuid::new_v4()))
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_try_create_wins_once() {
    let store = store();
    let key = unique_key();

    assert!(store.try_create(&key, b"first", Duration::from_secs(60)).await.unwrap());
    assert!(!store.try_create(&key, b"second", Duration::from_secs(60)).await.unwrap());
    assert_eq!(store.read(&key).await.unwrap(), b"first");
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_overwrite_keeps_ttl() {
    let store = store();
    let key = unique_key();

    store.try_create(&key, b"pending", Duration::from_secs(600)).await.unwrap();
    store.overwrite(&key, b"done").await.unwrap();

    assert_eq!(store.read(&key).await.unwrap(), b"done");
    let remaining = store.remaining_ttl(&key).await.unwrap().unwrap();
    assert!(remaining > Duration::from_secs(590));
    assert!(remaining <= Duration::from_secs(600));
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_missing_key_is_not_found() {
    let store = store();

    let err = store.read(&unique_key()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(err.is_store_error());
}
