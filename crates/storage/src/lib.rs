use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};

use shared::domain::{ProviderKind, StacksAddress};

pub const PREFERRED_WALLET_KEY: &str = "preferred_wallet";
pub const RELAY_ADDRESS_KEY: &str = "wc_address";

const MEMORY_DATABASE_URL: &str = "sqlite::memory:";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreferenceSnapshot {
    pub preferred_wallet: Option<ProviderKind>,
    pub relay_address: Option<StacksAddress>,
}

/// Durable record of the last successful wallet choice.
///
/// Implementations provide plain string key-value primitives; every write
/// must be atomic from the caller's perspective. The typed operations are
/// built on top and are the only ones the connection layer uses.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;

    async fn save(&self, kind: ProviderKind) -> Result<()> {
        self.set(PREFERRED_WALLET_KEY, kind.as_str()).await
    }

    /// Unknown or unreadable values load as absent; the record is only a hint.
    async fn load(&self) -> Result<Option<ProviderKind>> {
        Ok(self
            .get(PREFERRED_WALLET_KEY)
            .await?
            .and_then(|raw| raw.parse::<ProviderKind>().ok()))
    }

    async fn clear(&self) -> Result<()> {
        self.remove(PREFERRED_WALLET_KEY).await
    }

    async fn bind_relay_address(&self, address: &StacksAddress) -> Result<()> {
        self.set(RELAY_ADDRESS_KEY, address.as_str()).await
    }

    async fn relay_address(&self) -> Result<Option<StacksAddress>> {
        Ok(self
            .get(RELAY_ADDRESS_KEY)
            .await?
            .and_then(|raw| StacksAddress::parse(raw).ok()))
    }

    async fn clear_relay_address(&self) -> Result<()> {
        self.remove(RELAY_ADDRESS_KEY).await
    }

    async fn snapshot(&self) -> Result<PreferenceSnapshot> {
        Ok(PreferenceSnapshot {
            preferred_wallet: self.load().await?,
            relay_address: self.relay_address().await?,
        })
    }
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let database_url = normalize_database_url(database_url);
        ensure_sqlite_parent_dir_exists(&database_url)?;

        let connect_options =
            SqliteConnectOptions::from_str(&database_url)?.create_if_missing(true);
        // Every pooled connection to an in-memory url sees its own database.
        let pool_options = if database_url == MEMORY_DATABASE_URL {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open preference database '{database_url}'"))?;

        let storage = Self { pool };
        storage.ensure_preferences_table().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_preferences_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key        TEXT PRIMARY KEY NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure preferences table exists")?;
        Ok(())
    }
}

#[async_trait]
impl PreferenceStore for Storage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM preferences WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read preference '{key}'"))?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO preferences (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write preference '{key}'"))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM preferences WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove preference '{key}'"))?;
        Ok(())
    }
}

/// Process-local store for headless embeddings and tests.
#[derive(Default)]
pub struct MemoryPreferenceStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| anyhow!("preference store lock poisoned"))
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values()?.remove(key);
        Ok(())
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() || raw_database_url == MEMORY_DATABASE_URL {
        return MEMORY_DATABASE_URL.to_string();
    }

    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == MEMORY_DATABASE_URL || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
