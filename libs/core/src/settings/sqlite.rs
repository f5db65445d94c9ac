use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tokio::task::spawn_blocking;

use super::{AppTtsSetting, DeviceTtsSetting, SettingsError, SettingsStore, TtsVoice};

/// Tables owned by the admin service. Only read here; exported for fixtures and local setups.
pub const SETTINGS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS hardware_tts_settings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    hardware_device_id INTEGER,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    voice TEXT NOT NULL,
    voice_ref INTEGER,
    created_user_id INTEGER NOT NULL DEFAULT 0,
    updated_user_id INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS app_tts_settings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    app_id INTEGER NOT NULL UNIQUE,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    voice TEXT NOT NULL,
    voice_ref INTEGER,
    created_user_id INTEGER NOT NULL DEFAULT 0,
    updated_user_id INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT 0
);
"#;

/// Read-only adapter over the admin settings database.
#[derive(Clone)]
pub struct SqliteSettingsStore {
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteSettingsStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("open settings database {}", path.display()))?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, func: F) -> Result<T, SettingsError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| {
                SettingsError::Unavailable(anyhow::anyhow!("settings connection poisoned"))
            })?;
            func(&guard).map_err(|err| SettingsError::Unavailable(err.into()))
        })
        .await
        .map_err(|err| SettingsError::Unavailable(err.into()))?
    }
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn device_override(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceTtsSetting>, SettingsError> {
        let id = device_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT provider, model, voice, is_deleted FROM hardware_tts_settings
                 WHERE device_id = ?1
                 ORDER BY is_deleted ASC, updated_at DESC
                 LIMIT 1",
                params![id],
                |row| {
                    Ok(DeviceTtsSetting {
                        device_id: id.clone(),
                        voice: TtsVoice::new(
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ),
                        deleted: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn app_default(&self, app_id: &str) -> Result<Option<AppTtsSetting>, SettingsError> {
        let id = app_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT provider, model, voice FROM app_tts_settings WHERE app_id = ?1 LIMIT 1",
                params![id],
                |row| {
                    Ok(AppTtsSetting {
                        app_id: id.clone(),
                        voice: TtsVoice::new(
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ),
                    })
                },
            )
            .optional()
        })
        .await
    }
}
