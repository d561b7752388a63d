//! Redis-backed [`Store`].
//!
//! Each call is bounded by the configured timeout; a call that errors or
//! times out is reported as `StoreUnavailable`. Pool claims run as a Lua
//! script so the empty-check and the write happen in one server-side step.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisResult, Script};
use async_trait::async_trait;
use tracing::info;

use super::Store;
use crate::error::{Error, Result};

const CLAIM_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if current == '' then
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
  return 1
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
  redis.call('HSET', KEYS[1], ARGV[1], '')
  return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    claim: Script,
    release: Script,
    timeout: Duration,
}

impl RedisStore {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let connection = bounded(timeout, "connect", client.get_connection_manager()).await?;

        info!("Connected to store at {}", url);

        Ok(Self {
            connection,
            claim: Script::new(CLAIM_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            timeout,
        })
    }
}

async fn bounded<T>(
    timeout: Duration,
    operation: &str,
    future: impl Future<Output = RedisResult<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::StoreUnavailable(format!(
            "{} timed out after {}ms",
            operation,
            timeout.as_millis()
        ))),
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut connection = self.connection.clone();
        bounded(self.timeout, "HGETALL", connection.hgetall(key)).await
    }

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut connection = self.connection.clone();
        bounded(self.timeout, "HGET", connection.hget(key, field)).await
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        bounded(self.timeout, "HSET", connection.hset(key, field, value)).await
    }

    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut connection = self.connection.clone();
        bounded(self.timeout, "HSET", connection.hset_multiple(key, fields)).await
    }

    async fn claim_field(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut connection = self.connection.clone();
        let mut invocation = self.claim.key(key);
        invocation.arg(field).arg(value);
        let claimed: i64 = bounded(
            self.timeout,
            "claim",
            invocation.invoke_async(&mut connection),
        )
        .await?;
        Ok(claimed == 1)
    }

    async fn set_field_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut connection = self.connection.clone();
        bounded(self.timeout, "HSETNX", connection.hset_nx(key, field, value)).await
    }

    async fn release_field(&self, key: &str, field: &str, expected: &str) -> Result<bool> {
        let mut connection = self.connection.clone();
        let mut invocation = self.release.key(key);
        invocation.arg(field).arg(expected);
        let released: i64 = bounded(
            self.timeout,
            "release",
            invocation.invoke_async(&mut connection),
        )
        .await?;
        Ok(released == 1)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut connection = self.connection.clone();
        let pattern = format!("{}*", prefix);
        let mut keys: Vec<String> =
            bounded(self.timeout, "KEYS", connection.keys(pattern)).await?;
        keys.sort();
        Ok(keys)
    }
}
