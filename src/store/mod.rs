//! Shared key-value store holding bindings, groups and the dynamic pool.
//!
//! Every key maps to a hash of string fields. The layout is:
//!
//! - `client:<id>` and `mac:<addr>`: binding records
//! - `group:<name>`: group configuration
//! - `pool`: candidate IP → owner MAC (empty = free)
//!
//! A missing key reads as an empty hash; only a failed call is an error
//! ([`Error::StoreUnavailable`](crate::Error::StoreUnavailable)). Mutation
//! races between processes are settled by [`Store::claim_field`], which the
//! backend must perform atomically.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Key of the dynamic pool hash.
pub const POOL_KEY: &str = "pool";

pub fn client_key(client_id: &str) -> String {
    format!("client:{}", client_id)
}

pub fn mac_key(mac: &str) -> String {
    format!("mac:{}", mac)
}

pub fn group_key(name: &str) -> String {
    format!("group:{}", name)
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Returns every field of `key`, or an empty map if the key does not exist.
    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Writes several fields of one key in a single call.
    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    /// Sets `field` to `value` only if the field exists and is currently
    /// empty. Returns whether the write happened.
    async fn claim_field(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    /// Creates `field` with `value` only if the field does not exist yet.
    /// Returns whether the write happened.
    async fn set_field_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    /// Empties `field` only if it currently holds `expected`.
    async fn release_field(&self, key: &str, field: &str, expected: &str) -> Result<bool>;

    /// Lists keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

pub type DynStore = Arc<dyn Store>;
