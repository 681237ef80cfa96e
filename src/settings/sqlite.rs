//! SQLite-backed settings store

use super::{Settings, SettingsError, SettingsStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Settings persisted in a local SQLite database
#[derive(Clone)]
pub struct SqliteSettingsStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSettingsStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self, SettingsError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // Connection::open reports the missing directory otherwise.
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open a throwaway in-memory database
    pub fn open_in_memory() -> Result<Self, SettingsError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SettingsError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
              key TEXT PRIMARY KEY NOT NULL,
              value TEXT NOT NULL
            );
            "#,
        )?;
        tracing::debug!("Settings schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<F, T>(&self, op: F) -> Result<T, SettingsError>
    where
        F: FnOnce(&Connection) -> Result<T, SettingsError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            op(&conn)
        })
        .await
        .map_err(|_| SettingsError::Closed)?
    }
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn load(&self) -> Result<Settings, SettingsError> {
        let rows = self
            .blocking(|conn| {
                let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut parsed = Vec::with_capacity(rows.len());
        for (key, raw) in rows {
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => parsed.push((key, value)),
                Err(e) => tracing::warn!("Ignoring unreadable setting '{}': {}", key, e),
            }
        }
        Settings::from_rows(parsed)
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        let key = key.to_string();
        let raw = serde_json::to_string(&value)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, raw],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), SettingsError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{GOOGLE_ACCESS_TOKENS, RTSPS_SNAPSHOT};
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_set_load_delete() {
        let store = SqliteSettingsStore::open_in_memory().unwrap();
        store
            .set(RTSPS_SNAPSHOT, json!(["cam-1", "cam-2"]))
            .await
            .unwrap();
        store
            .set(GOOGLE_ACCESS_TOKENS, json!({ "access_token": "a" }))
            .await
            .unwrap();

        let settings = store.load().await.unwrap();
        assert_eq!(settings.rtsps_snapshot, vec!["cam-1", "cam-2"]);
        assert_eq!(settings.access_token(), Some("a"));

        store.delete(GOOGLE_ACCESS_TOKENS).await.unwrap();
        let settings = store.load().await.unwrap();
        assert!(settings.google_access_tokens.is_none());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_row() {
        let store = SqliteSettingsStore::open_in_memory().unwrap();
        store.set(RTSPS_SNAPSHOT, json!(["a"])).await.unwrap();
        store.set(RTSPS_SNAPSHOT, json!(["b"])).await.unwrap();
        assert_eq!(store.load().await.unwrap().rtsps_snapshot, vec!["b"]);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.sqlite");
        {
            let store = SqliteSettingsStore::open(&path).unwrap();
            store.set(RTSPS_SNAPSHOT, json!(["cam-9"])).await.unwrap();
        }
        let store = SqliteSettingsStore::open(&path).unwrap();
        assert_eq!(store.load().await.unwrap().rtsps_snapshot, vec!["cam-9"]);
    }
}
