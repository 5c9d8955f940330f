//! In-memory key-value store
//!
//! Data is lost when the service restarts.

use super::KvStore;
use crate::error::ResolverResult;

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Ordered in-memory store, thread-safe behind an async `RwLock`
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> ResolverResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> ResolverResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> ResolverResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn list_prefix(&self, prefix: &str) -> ResolverResult<Vec<(String, String)>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn health_check(&self) -> ResolverResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}
