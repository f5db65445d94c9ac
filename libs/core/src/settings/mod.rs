//! Text-to-speech settings resolution: device override, then application default, then the
//! system default.

mod memory;
#[cfg(feature = "store_sqlite")]
mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use memory::InMemorySettingsStore;
#[cfg(feature = "store_sqlite")]
pub use sqlite::{SETTINGS_SCHEMA_SQL, SqliteSettingsStore};

pub const DEFAULT_TTS_PROVIDER: &str = "doubao";
pub const DEFAULT_TTS_MODEL: &str = "speech-1";
pub const DEFAULT_TTS_VOICE: &str = "doubao-standard";

/// Provider/model/voice triple as stored by the admin service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtsVoice {
    pub provider: String,
    pub model: String,
    pub voice: String,
}

impl TtsVoice {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            voice: voice.into(),
        }
    }

    pub fn system_default() -> Self {
        Self::new(DEFAULT_TTS_PROVIDER, DEFAULT_TTS_MODEL, DEFAULT_TTS_VOICE)
    }
}

/// Per-device override, soft-deletable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTtsSetting {
    pub device_id: String,
    pub voice: TtsVoice,
    #[serde(default)]
    pub deleted: bool,
}

/// Application-wide default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTtsSetting {
    pub app_id: String,
    pub voice: TtsVoice,
}

/// Tier that produced an [`EffectiveTts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsSource {
    Device,
    App,
    Default,
}

impl TtsSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TtsSource::Device => "device",
            TtsSource::App => "app",
            TtsSource::Default => "default",
        }
    }
}

impl fmt::Display for TtsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings in effect for one resolution call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveTts {
    pub provider: String,
    pub model: String,
    pub voice: String,
    pub source: TtsSource,
}

impl EffectiveTts {
    fn from_voice(voice: TtsVoice, source: TtsSource) -> Self {
        Self {
            provider: voice.provider,
            model: voice.model,
            voice: voice.voice,
            source,
        }
    }
}

/// Lookup failures. A missing record is `Ok(None)`, never an error.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

/// Read-only view of the admin-owned settings records.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn device_override(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceTtsSetting>, SettingsError>;

    async fn app_default(&self, app_id: &str) -> Result<Option<AppTtsSetting>, SettingsError>;
}

pub type SharedSettingsStore = Arc<dyn SettingsStore>;

/// Applies the device > app > default chain. First match wins; tiers are never merged.
#[derive(Clone)]
pub struct SettingsResolver {
    store: SharedSettingsStore,
}

impl SettingsResolver {
    pub fn new(store: SharedSettingsStore) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        device_id: &str,
        app_id: Option<&str>,
    ) -> Result<EffectiveTts, SettingsError> {
        let device_id = device_id.trim();
        if !device_id.is_empty()
            && let Some(setting) = self.store.device_override(device_id).await?
            && !setting.deleted
        {
            debug!(device_id, "tts settings from device override");
            return Ok(EffectiveTts::from_voice(setting.voice, TtsSource::Device));
        }

        if let Some(app_id) = app_id.map(str::trim).filter(|id| !id.is_empty())
            && let Some(setting) = self.store.app_default(app_id).await?
        {
            debug!(device_id, app_id, "tts settings from app default");
            return Ok(EffectiveTts::from_voice(setting.voice, TtsSource::App));
        }

        Ok(EffectiveTts::from_voice(
            TtsVoice::system_default(),
            TtsSource::Default,
        ))
    }
}
