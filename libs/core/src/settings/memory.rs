use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{AppTtsSetting, DeviceTtsSetting, SettingsError, SettingsStore, TtsVoice};

/// In-process settings store for tests and local runs without the admin database.
#[derive(Clone, Default)]
pub struct InMemorySettingsStore {
    devices: Arc<DashMap<String, DeviceTtsSetting>>,
    apps: Arc<DashMap<String, AppTtsSetting>>,
    offline: Arc<AtomicBool>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_device(&self, device_id: impl Into<String>, voice: TtsVoice) {
        let device_id = device_id.into();
        self.devices.insert(
            device_id.clone(),
            DeviceTtsSetting {
                device_id,
                voice,
                deleted: false,
            },
        );
    }

    /// Soft-deletes a device override, as the admin API does.
    pub fn delete_device(&self, device_id: &str) {
        if let Some(mut entry) = self.devices.get_mut(device_id) {
            entry.deleted = true;
        }
    }

    pub fn put_app(&self, app_id: impl Into<String>, voice: TtsVoice) {
        let app_id = app_id.into();
        self.apps
            .insert(app_id.clone(), AppTtsSetting { app_id, voice });
    }

    /// Makes every lookup fail, simulating a storage outage.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), SettingsError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SettingsError::Unavailable(anyhow::anyhow!(
                "in-memory settings store is offline"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn device_override(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceTtsSetting>, SettingsError> {
        self.check_online()?;
        Ok(self.devices.get(device_id).map(|entry| entry.clone()))
    }

    async fn app_default(&self, app_id: &str) -> Result<Option<AppTtsSetting>, SettingsError> {
        self.check_online()?;
        Ok(self.apps.get(app_id).map(|entry| entry.clone()))
    }
}
