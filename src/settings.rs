//! Runtime-editable provider credentials (`/api/settings`).
//!
//! Unlike the rest of `Config`, these two keys can change after startup
//! without a restart: `PUT /api/settings` writes through to
//! `data_dir/settings.json` and every subsequent Streaming Client call
//! picks up the new value on its next attempt. Initial values come from
//! `Config` (env var or `gateway.toml`); a persisted `settings.json`
//! overrides them on the next boot.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Persisted {
    openrouter_api_key: Option<String>,
    opencode_zen_api_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SettingsStatus {
    pub openrouter_configured: bool,
    pub opencode_zen_configured: bool,
}

pub struct SettingsStore {
    openrouter_api_key: Mutex<Option<String>>,
    opencode_zen_api_key: Mutex<Option<String>>,
    data_dir: PathBuf,
}

impl SettingsStore {
    pub async fn load(config: &Config) -> Self {
        let data_dir = PathBuf::from(&config.data_dir);
        let path = data_dir.join("settings.json");

        let persisted = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Persisted>(&bytes).ok(),
            Err(_) => None,
        };

        let (openrouter, opencode_zen) = match persisted {
            Some(p) => (p.openrouter_api_key, p.opencode_zen_api_key),
            None => (config.openrouter_api_key.clone(), config.opencode_zen_api_key.clone()),
        };

        Self {
            openrouter_api_key: Mutex::new(openrouter),
            opencode_zen_api_key: Mutex::new(opencode_zen),
            data_dir,
        }
    }

    pub fn openrouter_api_key(&self) -> Option<String> {
        self.openrouter_api_key.lock().expect("settings mutex poisoned").clone()
    }

    pub fn opencode_zen_api_key(&self) -> Option<String> {
        self.opencode_zen_api_key.lock().expect("settings mutex poisoned").clone()
    }

    pub fn status(&self) -> SettingsStatus {
        SettingsStatus {
            openrouter_configured: self.openrouter_api_key().is_some(),
            opencode_zen_configured: self.opencode_zen_api_key().is_some(),
        }
    }

    /// Apply an update. `None` leaves a key untouched; `Some("")` clears
    /// it; `Some(value)` sets it. Persists the resulting pair.
    pub async fn update(&self, openrouter_api_key: Option<String>, opencode_zen_api_key: Option<String>) {
        let snapshot = {
            let mut openrouter = self.openrouter_api_key.lock().expect("settings mutex poisoned");
            let mut opencode_zen = self.opencode_zen_api_key.lock().expect("settings mutex poisoned");

            if let Some(value) = openrouter_api_key {
                *openrouter = if value.is_empty() { None } else { Some(value) };
            }
            if let Some(value) = opencode_zen_api_key {
                *opencode_zen = if value.is_empty() { None } else { Some(value) };
            }

            Persisted { openrouter_api_key: openrouter.clone(), opencode_zen_api_key: opencode_zen.clone() }
        };

        self.persist(&snapshot).await;
    }

    async fn persist(&self, snapshot: &Persisted) {
        if let Err(err) = tokio::fs::create_dir_all(&self.data_dir).await {
            tracing::warn!(error = %err, "failed to create data directory, settings not persisted");
            return;
        }
        let path = self.data_dir.join("settings.json");
        match serde_json::to_vec_pretty(snapshot) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(&path, bytes).await {
                    tracing::warn!(error = %err, path = %path.display(), "failed to persist settings");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize settings"),
        }
    }
}
