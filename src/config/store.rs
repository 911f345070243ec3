use arc_swap::ArcSwap;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Key of the configuration document in the `config` table
const APP_CONFIG_KEY: &str = "app_config";

/// Configuration store backed by SQLite
///
/// Uses `ArcSwap` for lock-free reads.
#[derive(Clone)]
pub struct ConfigStore {
    pool: Pool<Sqlite>,
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Open (or create) the store at `db_path`
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            // Single writer; one connection for reads, one for writes
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect(&db_url)
            .await?;

        Self::init_schema(&pool).await?;

        let config = Self::load_config(&pool).await?;
        let cache = Arc::new(ArcSwap::from_pointee(config));

        info!("Configuration loaded from {}", db_path.display());
        Ok(Self { pool, cache })
    }

    async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn load_config(pool: &Pool<Sqlite>) -> Result<AppConfig> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?1")
            .bind(APP_CONFIG_KEY)
            .fetch_optional(pool)
            .await?;

        match row {
            Some((json,)) => {
                serde_json::from_str(&json).map_err(|e| AppError::Config(e.to_string()))
            }
            None => {
                let config = AppConfig::default();
                Self::save_config_to_db(pool, &config).await?;
                Ok(config)
            }
        }
    }

    async fn save_config_to_db(pool: &Pool<Sqlite>, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;

        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_at)
            VALUES (?1, ?2, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')
            "#,
        )
        .bind(APP_CONFIG_KEY)
        .bind(&json)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; concurrent updates are last-write-wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);
        config.validate()?;

        // Persist first, then swap the cache
        Self::save_config_to_db(&self.pool, &config).await?;
        self.cache.store(Arc::new(config));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("paircall.db");

        let store = ConfigStore::new(&db_path).await.unwrap();
        assert_eq!(store.get().signaling.relay_url, "ws://localhost:3001");

        store
            .update(|c| {
                c.signaling.relay_url = "wss://relay.example.org".to_string();
                c.session.max_message_length = 200;
            })
            .await
            .unwrap();

        let config = store.get();
        assert_eq!(config.signaling.relay_url, "wss://relay.example.org");
        assert_eq!(config.session.max_message_length, 200);

        // New store instance sees the persisted values
        let store2 = ConfigStore::new(&db_path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.signaling.relay_url, "wss://relay.example.org");
        assert_eq!(config.session.max_message_length, 200);
    }

    #[tokio::test]
    async fn test_invalid_update_is_not_persisted() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(&dir.path().join("nested").join("paircall.db"))
            .await
            .unwrap();

        let result = store
            .update(|c| c.signaling.relay_url = "not a url".to_string())
            .await;
        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(store.get().signaling.relay_url, "ws://localhost:3001");
    }
}
