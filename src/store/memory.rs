//! In-process [`Store`] used by tests and single-node setups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Store;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, HashMap<String, String>>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `StoreUnavailable` until reset.
    pub fn fail_requests(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Seeds a hash, replacing any existing fields with the same names.
    pub async fn insert<K, V>(&self, key: &str, fields: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut data = self.data.write().await;
        let entry = data.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field.into(), value.into());
        }
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(
                "memory store is failing requests".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data.get(key).cloned().unwrap_or_default())
    }

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data.get(key).and_then(|hash| hash.get(field).cloned()))
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        data.entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        let entry = data.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn claim_field(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.check()?;
        let mut data = self.data.write().await;
        match data.get_mut(key).and_then(|hash| hash.get_mut(field)) {
            Some(current) if current.is_empty() => {
                *current = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_field_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.check()?;
        let mut data = self.data.write().await;
        let hash = data.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn release_field(&self, key: &str, field: &str, expected: &str) -> Result<bool> {
        self.check()?;
        let mut data = self.data.write().await;
        match data.get_mut(key).and_then(|hash| hash.get_mut(field)) {
            Some(current) if current == expected => {
                current.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        let data = self.data.read().await;
        let mut keys: Vec<String> = data
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
