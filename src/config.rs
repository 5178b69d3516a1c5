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


//! Engine configuration
//!
//! `EngineConfig` holds process-level knobs: where things live on disk and the
//! timing constants of the persistence and retry machinery. It is supplied once
//! by the host (JSON over the bridge, flags in the CLI, or `from_env`).
//!
//! User-tunable download behaviour (quota, concurrency, auto-cleanup) is not here;
//! see [`crate::settings::DownloadSettings`], which is persisted and editable at runtime.
//!
//! # Environment variables
//! - `MANGASHELF_CACHE_ROOT` - root for `image_cache/`
//! - `MANGASHELF_DOWNLOADS_ROOT` - root for `manga_<id>/chapter_<n>/`
//! - `MANGASHELF_DATABASE_PATH` - SQLite file holding persisted state
//! - `MANGASHELF_MAX_IMAGE_CACHE_SIZE` - bytes
//! - `MANGASHELF_TRANSFER_TIMEOUT_SECS`
//! - `MANGASHELF_MIN_FREE_SPACE` - bytes

use crate::error::{Result, ShelfError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MAX_IMAGE_CACHE_SIZE: u64 = 100 * 1024 * 1024;
const DEFAULT_MIN_FREE_SPACE: u64 = 100 * 1024 * 1024;

/// Process-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for the image cache (`image_cache/...` lives below it)
    pub cache_root: PathBuf,

    /// Root directory for downloaded chapters
    pub downloads_root: PathBuf,

    /// SQLite database for persisted state. `None` keeps state in memory.
    pub database_path: Option<PathBuf>,

    /// Maximum bytes the persistent image cache may occupy
    pub max_image_cache_size: u64,

    /// Upper bound for a single HTTP transfer
    pub transfer_timeout_secs: u64,

    /// Inactivity window before chapter/image metadata is written
    pub metadata_flush_delay_ms: u64,

    /// Inactivity window before usage statistics are written
    pub usage_stats_flush_delay_ms: u64,

    /// Lifetime of a cached status record
    pub status_cache_ttl_ms: u64,

    /// Attempts per image download (first try included)
    pub retry_attempts: u32,

    /// Base delay of the exponential backoff
    pub retry_base_delay_ms: u64,

    /// Device free-space floor that triggers aggressive cleanup
    pub min_free_space: u64,

    /// User-Agent sent with image requests
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("mangashelf");
        Self {
            cache_root: base.clone(),
            downloads_root: base.join("downloads"),
            database_path: None,
            max_image_cache_size: DEFAULT_MAX_IMAGE_CACHE_SIZE,
            transfer_timeout_secs: 60,
            metadata_flush_delay_ms: 2_000,
            usage_stats_flush_delay_ms: 5_000,
            status_cache_ttl_ms: 1_000,
            retry_attempts: 3,
            retry_base_delay_ms: 1_000,
            min_free_space: DEFAULT_MIN_FREE_SPACE,
            user_agent: concat!("MangaShelf/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl EngineConfig {
    /// Config rooted at a single directory, with the database inside it
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            cache_root: root.clone(),
            downloads_root: root.join("downloads"),
            database_path: Some(root.join("mangashelf.db")),
            ..Self::default()
        }
    }

    /// Build from `MANGASHELF_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_root: std::env::var("MANGASHELF_CACHE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_root),
            downloads_root: std::env::var("MANGASHELF_DOWNLOADS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.downloads_root),
            database_path: std::env::var("MANGASHELF_DATABASE_PATH")
                .ok()
                .map(PathBuf::from)
                .or(defaults.database_path),
            max_image_cache_size: std::env::var("MANGASHELF_MAX_IMAGE_CACHE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_image_cache_size),
            transfer_timeout_secs: std::env::var("MANGASHELF_TRANSFER_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.transfer_timeout_secs),
            min_free_space: std::env::var("MANGASHELF_MIN_FREE_SPACE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.min_free_space),
            ..defaults
        }
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.retry_attempts == 0 {
            return Err(ShelfError::InvalidConfiguration(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.transfer_timeout_secs == 0 {
            return Err(ShelfError::InvalidConfiguration(
                "transfer_timeout_secs must be positive".to_string(),
            ));
        }
        if self.downloads_root.as_os_str().is_empty() || self.cache_root.as_os_str().is_empty() {
            return Err(ShelfError::InvalidConfiguration(
                "storage roots must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn image_cache_dir(&self) -> PathBuf {
        self.cache_root.join("image_cache")
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn metadata_flush_delay(&self) -> Duration {
        Duration::from_millis(self.metadata_flush_delay_ms)
    }

    pub fn usage_stats_flush_delay(&self) -> Duration {
        Duration::from_millis(self.usage_stats_flush_delay_ms)
    }

    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.status_cache_ttl_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}
