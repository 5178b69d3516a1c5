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


//! Records kept about downloaded chapters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Bumped when the on-disk `metadata.json` layout changes
pub const METADATA_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

/// One page image of a chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterImage {
    pub page_number: u32,
    pub original_url: String,
    pub local_path: PathBuf,
    pub download_status: ImageStatus,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterMetadata {
    pub manga_id: String,
    pub chapter_number: String,
    pub downloaded_at: DateTime<Utc>,

    /// Pages present on disk
    pub total_images: usize,

    /// Bytes of the pages present on disk
    pub total_size: u64,

    pub schema_version: u32,

    #[serde(default)]
    pub images: Vec<ChapterImage>,
}

impl ChapterMetadata {
    pub fn original_url(&self, page_number: u32) -> Option<&str> {
        self.images
            .iter()
            .find(|image| image.page_number == page_number)
            .map(|image| image.original_url.as_str())
    }
}

/// manga_id -> chapter_number -> metadata
pub type MetadataIndex = HashMap<String, HashMap<String, ChapterMetadata>>;

/// A page to download, as produced by the chapter source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page_number: u32,
    pub original_url: String,
}

impl PageRequest {
    pub fn new(page_number: u32, original_url: impl Into<String>) -> Self {
        Self {
            page_number,
            original_url: original_url.into(),
        }
    }
}

/// Identity of a stored chapter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChapterKey {
    pub manga_id: String,
    pub chapter_number: String,
}

impl ChapterKey {
    pub fn new(manga_id: impl Into<String>, chapter_number: impl Into<String>) -> Self {
        Self {
            manga_id: manga_id.into(),
            chapter_number: chapter_number.into(),
        }
    }
}

/// Access bookkeeping used to rank chapters for eviction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageUsageStats {
    pub last_access_time: HashMap<String, HashMap<String, DateTime<Utc>>>,
    pub access_count: HashMap<String, HashMap<String, u64>>,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub total_downloads_ever: u64,
    pub total_size_downloaded_ever: u64,
}

impl StorageUsageStats {
    pub fn record_access(&mut self, manga_id: &str, chapter_number: &str, at: DateTime<Utc>) {
        self.last_access_time
            .entry(manga_id.to_string())
            .or_default()
            .insert(chapter_number.to_string(), at);
        *self
            .access_count
            .entry(manga_id.to_string())
            .or_default()
            .entry(chapter_number.to_string())
            .or_insert(0) += 1;
    }

    pub fn last_access(&self, manga_id: &str, chapter_number: &str) -> Option<DateTime<Utc>> {
        self.last_access_time
            .get(manga_id)
            .and_then(|chapters| chapters.get(chapter_number))
            .copied()
    }

    pub fn access_count(&self, manga_id: &str, chapter_number: &str) -> u64 {
        self.access_count
            .get(manga_id)
            .and_then(|chapters| chapters.get(chapter_number))
            .copied()
            .unwrap_or(0)
    }

    pub fn remove(&mut self, manga_id: &str, chapter_number: &str) {
        if let Some(chapters) = self.last_access_time.get_mut(manga_id) {
            chapters.remove(chapter_number);
            if chapters.is_empty() {
                self.last_access_time.remove(manga_id);
            }
        }
        if let Some(chapters) = self.access_count.get_mut(manga_id) {
            chapters.remove(chapter_number);
            if chapters.is_empty() {
                self.access_count.remove(manga_id);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Bytes of page files present on disk
    pub total_size: u64,
    pub total_chapters: usize,
    pub manga_count: usize,

    /// Quota remaining
    pub available_space: u64,

    /// Free bytes on the device, or the quota remainder when the probe fails
    pub device_free_space: u64,

    pub oldest_download: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MangaStorage {
    pub manga_id: String,
    pub chapter_count: usize,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedStorageStats {
    #[serde(flatten)]
    pub stats: StorageStats,
    pub max_storage_size: u64,
    pub usage_percent: f64,

    /// Usage reached the configured warning threshold
    pub warning: bool,

    /// Largest first
    pub per_manga: Vec<MangaStorage>,

    pub last_cleanup: Option<DateTime<Utc>>,
    pub total_downloads_ever: u64,
    pub total_size_downloaded_ever: u64,
}

/// Filters for a user-triggered cleanup; at least one must be set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualCleanupOptions {
    /// Only chapters not read for this many days
    pub older_than_days: Option<u32>,

    /// Only chapters of this manga
    pub manga_id: Option<String>,

    /// Evict (least valuable first) until total usage is at most this many bytes
    pub target_size: Option<u64>,
}

impl ManualCleanupOptions {
    pub fn is_empty(&self) -> bool {
        self.older_than_days.is_none() && self.manga_id.is_none() && self.target_size.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub deleted: Vec<ChapterKey>,
    pub freed_bytes: u64,
}

impl CleanupReport {
    pub fn merge(&mut self, other: CleanupReport) {
        self.deleted.extend(other.deleted);
        self.freed_bytes += other.freed_bytes;
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
    }
}
