//! `LockStore` over a managed Redis connection

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, RedisError, Script};
use rlock::{LockStore, StoreError};
use tracing::{debug, info};

use crate::config::RedisStoreConfig;

const ACQUIRE_SCRIPT: &str = include_str!("lua/acquire.lua");
const EXTEND_SCRIPT: &str = include_str!("lua/extend.lua");
const DELETE_SCRIPT: &str = include_str!("lua/delete.lua");

/// Redis-backed lock store.
///
/// Cloning is cheap: clones share the multiplexed connection. Scripts are sent
/// with `EVALSHA` and fall back to `EVAL` when the server cache misses.
#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
    key_prefix: String,
    acquire_script: Script,
    extend_script: Script,
    delete_script: Script,
}

impl RedisLockStore {
    /// Wrap an existing connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: String::new(),
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
            delete_script: Script::new(DELETE_SCRIPT),
        }
    }

    /// Open a managed connection described by `config`.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str()).map_err(StoreError::backend)?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(config.connection_timeout())
            .set_response_timeout(config.response_timeout());
        let conn = client
            .get_connection_manager_with_config(manager_config)
            .await
            .map_err(map_redis_error)?;

        info!(
            url = %redacted(&config.url),
            key_prefix = %config.key_prefix,
            "Connected to redis lock store"
        );
        Ok(Self::new(conn).with_key_prefix(config.key_prefix.clone()))
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn full_key(&self, key: &str) -> String {
        prefixed(&self.key_prefix, key)
    }
}

impl fmt::Debug for RedisLockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLockStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(token)
            .arg("PX")
            .arg(lease_millis(lease))
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        set_nx_reply(reply)
    }

    async fn acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: i64 = self
            .acquire_script
            .key(self.full_key(key))
            .arg(token)
            .arg(lease_millis(lease))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        flag_reply("acquire", reply)
    }

    async fn extend_if_owner(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: i64 = self
            .extend_script
            .key(self.full_key(key))
            .arg(token)
            .arg(lease_millis(lease))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        flag_reply("extend", reply)
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let reply: i64 = self
            .delete_script
            .key(self.full_key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        count_reply("delete", reply)
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}{}", prefix, key)
    }
}

/// Redis rejects a zero `PX`; sub-millisecond leases round up.
fn lease_millis(lease: Duration) -> u64 {
    (lease.as_millis() as u64).max(1)
}

/// `SET .. NX` answers `OK` when written and nil when the key exists.
fn set_nx_reply(reply: Option<String>) -> Result<bool, StoreError> {
    match reply.as_deref() {
        Some("OK") => Ok(true),
        None => Ok(false),
        Some(other) => Err(StoreError::UnexpectedReply(format!("SET NX: {}", other))),
    }
}

fn count_reply(op: &str, reply: i64) -> Result<u64, StoreError> {
    u64::try_from(reply).map_err(|_| StoreError::UnexpectedReply(format!("{}: {}", op, reply)))
}

fn flag_reply(op: &str, reply: i64) -> Result<bool, StoreError> {
    match reply {
        1 => Ok(true),
        0 => Ok(false),
        other => Err(StoreError::UnexpectedReply(format!("{}: {}", op, other))),
    }
}

fn map_redis_error(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        debug!(error = %err, "Redis connection failure");
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::backend(err)
    }
}

/// Strip the password from a connection URL before logging it.
fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
