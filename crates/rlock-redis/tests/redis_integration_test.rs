//! Redis Integration Tests
//!
//! These tests require a running Redis server.
//! Run with: RLOCK_REDIS_URL=redis://127.0.0.1:6379 cargo test -p rlock-redis -- --ignored

use std::sync::{Arc, Once};
use std::time::Duration;

use rlock::{CancellationToken, FixedIntervalRetry, LockClient, LockStore, NoRetry};
use rlock_redis::{RedisLockStore, RedisStoreConfig};

const TIMEOUT: Duration = Duration::from_secs(1);

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rlock=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

async fn connect() -> anyhow::Result<RedisLockStore> {
    init_tracing();
    let url = std::env::var("RLOCK_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let config = RedisStoreConfig::new(url).with_key_prefix("rlock-test:");
    Ok(RedisLockStore::connect(&config).await?)
}

fn unique_key(name: &str) -> String {
    format!("{}-{}", name, uuid::Uuid::new_v4())
}

// ============== Store Primitive Tests ==============

#[tokio::test]
#[ignore]
async fn test_set_if_absent() -> anyhow::Result<()> {
    let store = connect().await?;
    let key = unique_key("set-if-absent");

    assert!(store.set_if_absent(&key, "a", Duration::from_secs(5)).await?);
    assert!(!store.set_if_absent(&key, "b", Duration::from_secs(5)).await?);
    assert_eq!(store.delete_if_owner(&key, "a").await?, 1);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_acquire_is_reentrant_for_same_token() -> anyhow::Result<()> {
    let store = connect().await?;
    let key = unique_key("acquire");

    assert!(store.acquire(&key, "a", Duration::from_secs(5)).await?);
    assert!(store.acquire(&key, "a", Duration::from_secs(5)).await?);
    assert!(!store.acquire(&key, "b", Duration::from_secs(5)).await?);
    store.delete_if_owner(&key, "a").await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_extend_and_delete_check_owner() -> anyhow::Result<()> {
    let store = connect().await?;
    let key = unique_key("owner");

    assert!(store.set_if_absent(&key, "a", Duration::from_secs(5)).await?);
    assert!(!store.extend_if_owner(&key, "b", Duration::from_secs(5)).await?);
    assert!(store.extend_if_owner(&key, "a", Duration::from_secs(5)).await?);
    assert_eq!(store.delete_if_owner(&key, "b").await?, 0);
    assert_eq!(store.delete_if_owner(&key, "a").await?, 1);
    assert!(!store.extend_if_owner(&key, "a", Duration::from_secs(5)).await?);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_lease_expires() -> anyhow::Result<()> {
    let store = connect().await?;
    let key = unique_key("expiry");

    assert!(store.set_if_absent(&key, "a", Duration::from_millis(200)).await?);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.set_if_absent(&key, "b", Duration::from_secs(5)).await?);
    store.delete_if_owner(&key, "b").await?;
    Ok(())
}

// ============== Client Tests ==============

#[tokio::test]
#[ignore]
async fn test_client_lock_lifecycle() -> anyhow::Result<()> {
    let client = LockClient::new(Arc::new(connect().await?));
    let key = unique_key("lifecycle");

    let handle = Arc::new(client.try_acquire(&key, Duration::from_secs(2), TIMEOUT).await?);
    assert!(
        client
            .try_acquire(&key, Duration::from_secs(2), TIMEOUT)
            .await
            .unwrap_err()
            .is_contended()
    );

    handle.refresh(TIMEOUT).await?;
    handle.unlock(TIMEOUT).await?;

    let again = client
        .acquire(&key, Duration::from_secs(2), NoRetry, TIMEOUT, &CancellationToken::new())
        .await?;
    again.unlock(TIMEOUT).await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_client_waits_for_release() -> anyhow::Result<()> {
    let client = LockClient::new(Arc::new(connect().await?));
    let key = unique_key("waiter");

    let holder = client.try_acquire(&key, Duration::from_secs(5), TIMEOUT).await?;
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        holder.unlock(TIMEOUT).await
    });

    let handle = client
        .acquire(
            &key,
            Duration::from_secs(5),
            FixedIntervalRetry::new(Duration::from_millis(50), 20),
            TIMEOUT,
            &CancellationToken::new(),
        )
        .await?;
    releaser.await??;
    handle.unlock(TIMEOUT).await?;
    Ok(())
}
