//! PostgreSQL key-value store

use super::KvStore;
use crate::config::StoreConfig;
use crate::error::{ResolverError, ResolverResult};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// Key-value store backed by a single PostgreSQL table
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool using the store configuration
    pub async fn connect(config: &StoreConfig) -> ResolverResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| ResolverError::Config("store.url is required for postgres".into()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(url)
            .await
            .map_err(|e| ResolverError::StoreUnavailable(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Create the key-value table if needed
    pub async fn run_migrations(&self) -> ResolverResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resolver_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Store migrations complete");
        Ok(())
    }
}

#[async_trait]
impl KvStore for PgStore {
    async fn get(&self, key: &str) -> ResolverResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM resolver_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> ResolverResult<()> {
        sqlx::query(
            r#"
            INSERT INTO resolver_kv (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key)
            DO UPDATE SET value = $2, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        debug!("Stored key {}", key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> ResolverResult<bool> {
        let result = sqlx::query("DELETE FROM resolver_kv WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_prefix(&self, prefix: &str) -> ResolverResult<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT key, value FROM resolver_kv WHERE starts_with(key, $1) ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
            .collect())
    }

    async fn health_check(&self) -> ResolverResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| ResolverError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL store closed");
    }
}
