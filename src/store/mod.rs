//! Durable key-value storage
//!
//! The ledger and vault persist through [`KvStore`], a minimal get/set/delete/prefix
//! interface with read-your-writes consistency. There are no cross-key transactions:
//! callers write primary records before secondary indexes and serialise
//! read-modify-write cycles with [`KeyedLocks`].
//!
//! Implementations:
//! - `PgStore` - PostgreSQL, used in production
//! - `MemoryStore` - in-memory, used by tests and local development

mod locks;
mod memory;
mod postgres;

pub use locks::KeyedLocks;
pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::ResolverResult;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value; absence is `Ok(None)`
    async fn get(&self, key: &str) -> ResolverResult<Option<String>>;

    /// Insert or replace a value
    async fn set(&self, key: &str, value: &str) -> ResolverResult<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> ResolverResult<bool>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn list_prefix(&self, prefix: &str) -> ResolverResult<Vec<(String, String)>>;

    async fn health_check(&self) -> ResolverResult<()>;

    /// Release the underlying resources. Further calls may fail.
    async fn close(&self);
}

/// Open the configured store backend
pub async fn open(config: &StoreConfig) -> ResolverResult<Arc<dyn KvStore>> {
    match config.backend {
        StoreBackend::Postgres => {
            let store = PgStore::connect(config).await?;
            store.run_migrations().await?;
            info!("PostgreSQL store opened");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            info!("In-memory store opened, state will not survive restarts");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Load and deserialize a JSON value
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> ResolverResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and store a JSON value
pub async fn save_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> ResolverResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw).await
}

/// Load every JSON value under a prefix
pub async fn list_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    prefix: &str,
) -> ResolverResult<Vec<T>> {
    store
        .list_prefix(prefix)
        .await?
        .into_iter()
        .map(|(_, raw)| serde_json::from_str(&raw).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Checkpoint {
        chain_id: u64,
        block: u64,
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryStore::new();
        let value = Checkpoint {
            chain_id: 1,
            block: 42,
        };

        save_json(&store, "checkpoint:1", &value).await.unwrap();
        let loaded: Option<Checkpoint> = load_json(&store, "checkpoint:1").await.unwrap();
        assert_eq!(loaded, Some(value));

        let missing: Option<Checkpoint> = load_json(&store, "checkpoint:2").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_list_json_surfaces_corrupt_values() {
        let store = MemoryStore::new();
        store.set("checkpoint:1", "{not json").await.unwrap();
        let result: ResolverResult<Vec<Checkpoint>> = list_json(&store, "checkpoint:").await;
        assert!(result.is_err());
    }
}
