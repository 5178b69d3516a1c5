// MangaShelf - Offline Manga Reader Core
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! User-tunable download settings
//!
//! A single [`DownloadSettings`] document, loaded once and written back on every
//! update. Missing or corrupt documents fall back to defaults; documents written
//! by older versions get defaults for fields they lack.

use crate::error::{Result, ShelfError};
use crate::storage::{keys, KeyValueStore};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub const DEFAULT_MAX_STORAGE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadQuality {
    Low,
    Medium,
    High,
}

/// Download behaviour configured by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    pub max_concurrent_downloads: usize,

    /// Quota for downloaded chapters, in bytes
    pub max_storage_size: u64,

    pub auto_download_bookmarked: bool,
    pub download_quality: DownloadQuality,
    pub enable_background_downloads: bool,

    /// Usage percentage at which storage stats report a warning
    pub storage_warning_threshold_percent: u8,

    pub auto_cleanup_enabled: bool,

    /// Chapters unread for longer than this are removed by auto-cleanup
    pub auto_cleanup_days: u32,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            max_storage_size: DEFAULT_MAX_STORAGE_SIZE,
            auto_download_bookmarked: false,
            download_quality: DownloadQuality::High,
            enable_background_downloads: true,
            storage_warning_threshold_percent: 80,
            auto_cleanup_enabled: false,
            auto_cleanup_days: 30,
        }
    }
}

/// Partial update; `None` keeps the current value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettingsUpdate {
    pub max_concurrent_downloads: Option<usize>,
    pub max_storage_size: Option<u64>,
    pub auto_download_bookmarked: Option<bool>,
    pub download_quality: Option<DownloadQuality>,
    pub enable_background_downloads: Option<bool>,
    pub storage_warning_threshold_percent: Option<u8>,
    pub auto_cleanup_enabled: Option<bool>,
    pub auto_cleanup_days: Option<u32>,
}

impl DownloadSettings {
    fn apply(&mut self, update: DownloadSettingsUpdate) {
        if let Some(v) = update.max_concurrent_downloads {
            self.max_concurrent_downloads = v;
        }
        if let Some(v) = update.max_storage_size {
            self.max_storage_size = v;
        }
        if let Some(v) = update.auto_download_bookmarked {
            self.auto_download_bookmarked = v;
        }
        if let Some(v) = update.download_quality {
            self.download_quality = v;
        }
        if let Some(v) = update.enable_background_downloads {
            self.enable_background_downloads = v;
        }
        if let Some(v) = update.storage_warning_threshold_percent {
            self.storage_warning_threshold_percent = v;
        }
        if let Some(v) = update.auto_cleanup_enabled {
            self.auto_cleanup_enabled = v;
        }
        if let Some(v) = update.auto_cleanup_days {
            self.auto_cleanup_days = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(ShelfError::invalid_input(
                "max_concurrent_downloads must be at least 1",
            ));
        }
        if self.max_storage_size == 0 {
            return Err(ShelfError::invalid_input("max_storage_size must be positive"));
        }
        if self.storage_warning_threshold_percent > 100 {
            return Err(ShelfError::invalid_input(
                "storage_warning_threshold_percent must be between 0 and 100",
            ));
        }
        Ok(())
    }
}

/// Owner of the settings document
#[derive(Debug)]
pub struct SettingsStore {
    kv: KeyValueStore,
    current: RwLock<Option<DownloadSettings>>,
}

impl SettingsStore {
    pub fn new(kv: KeyValueStore) -> Self {
        Self {
            kv,
            current: RwLock::new(None),
        }
    }

    /// Current settings, loaded from storage on first use
    pub async fn get(&self) -> DownloadSettings {
        if let Some(settings) = self.current.read().await.as_ref() {
            return settings.clone();
        }

        let mut current = self.current.write().await;
        if let Some(settings) = current.as_ref() {
            return settings.clone();
        }

        let loaded = match self.kv.get::<DownloadSettings>(keys::DOWNLOAD_SETTINGS).await {
            Ok(Some(settings)) if settings.validate().is_ok() => settings,
            Ok(Some(_)) => {
                tracing::warn!("persisted download settings are invalid, using defaults");
                DownloadSettings::default()
            }
            Ok(None) => DownloadSettings::default(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load download settings, using defaults");
                DownloadSettings::default()
            }
        };
        *current = Some(loaded.clone());
        loaded
    }

    /// Merge `update` over the current settings and persist the result
    pub async fn update(&self, update: DownloadSettingsUpdate) -> Result<DownloadSettings> {
        let mut settings = self.get().await;
        settings.apply(update);
        settings.validate()?;

        self.kv.set(keys::DOWNLOAD_SETTINGS, &settings).await?;
        *self.current.write().await = Some(settings.clone());
        tracing::info!(?settings, "download settings updated");
        Ok(settings)
    }

    pub async fn reset(&self) -> Result<DownloadSettings> {
        let settings = DownloadSettings::default();
        self.kv.set(keys::DOWNLOAD_SETTINGS, &settings).await?;
        *self.current.write().await = Some(settings.clone());
        Ok(settings)
    }
}
