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


//! Image cache records

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;

/// Search thumbnails are refreshed after this long
pub const SEARCH_TTL_HOURS: i64 = 1;

/// Covers and banners expire after this long
pub const PERSISTENT_TTL_DAYS: i64 = 30;

/// Where an image is shown, which decides its lifetime and location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheContext {
    Manga,
    Search,
    Bookmark,
    Download,
}

impl CacheContext {
    pub fn is_transient(self) -> bool {
        self == CacheContext::Search
    }

    pub fn ttl(self) -> Duration {
        if self.is_transient() {
            Duration::hours(SEARCH_TTL_HOURS)
        } else {
            Duration::days(PERSISTENT_TTL_DAYS)
        }
    }
}

impl std::str::FromStr for CacheContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manga" => Ok(CacheContext::Manga),
            "search" => Ok(CacheContext::Search),
            "bookmark" => Ok(CacheContext::Bookmark),
            "download" => Ok(CacheContext::Download),
            other => Err(format!("unknown cache context '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub manga_id: Option<String>,
    pub original_url: String,
    pub cached_path: PathBuf,
    pub last_accessed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub context: CacheContext,
    pub file_size: u64,
    pub url_hash: String,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.last_updated > self.context.ttl()
    }
}

/// cache key -> entry
pub type CacheIndex = HashMap<String, CacheEntry>;

pub fn hash_url(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(&digest[..16])
}

/// Search images are shared by URL; everything else is scoped to its manga
pub fn cache_key(url_hash: &str, context: CacheContext, manga_id: Option<&str>) -> String {
    if context.is_transient() {
        url_hash.to_string()
    } else {
        format!("{}_{}", manga_id.unwrap_or("shared"), url_hash)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageCacheStats {
    pub total_entries: usize,
    pub total_size: u64,
    pub search_entries: usize,
    pub search_size: u64,
    pub persistent_entries: usize,
    pub persistent_size: u64,
    pub max_cache_size: u64,
    pub usage_percent: f64,
}

impl ImageCacheStats {
    pub fn from_index(index: &CacheIndex, max_cache_size: u64) -> Self {
        let mut stats = ImageCacheStats {
            max_cache_size,
            ..Default::default()
        };
        for entry in index.values() {
            if entry.context.is_transient() {
                stats.search_entries += 1;
                stats.search_size += entry.file_size;
            } else {
                stats.persistent_entries += 1;
                stats.persistent_size += entry.file_size;
            }
        }
        stats.total_entries = index.len();
        stats.total_size = stats.search_size + stats.persistent_size;
        if max_cache_size > 0 {
            stats.usage_percent = stats.total_size as f64 / max_cache_size as f64 * 100.0;
        }
        stats
    }
}
