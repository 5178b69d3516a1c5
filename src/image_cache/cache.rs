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


//! Cover, banner and search thumbnail cache
//!
//! Two areas under `<cache_root>/image_cache/`:
//!
//! ```text
//! search_temp/    <hash>_<timestamp>.jpg   shared by URL, refreshed after 1 h
//! manga_covers/   <manga>_<hash>.jpg       per manga, 30 days or size pressure
//! ```
//!
//! Lookups never fail: when an image cannot be fetched after retries the
//! caller gets the original URL back and can load it remotely. Concurrent
//! lookups of the same image share one download.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::content::layout::sanitize_component;
use crate::error::{Result, ShelfError};
use crate::image_cache::models::{cache_key, hash_url, CacheContext, CacheEntry, CacheIndex, ImageCacheStats};
use crate::net::{retry_with_backoff, ImageFetcher, RetryPolicy};
use crate::storage::{keys, Debouncer, KeyValueStore};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::{OnceCell, RwLock};

/// Eviction starts above this share of the size limit...
const EVICTION_HIGH_WATER: f64 = 0.85;
/// ...and stops once usage is back under this one
const EVICTION_LOW_WATER: f64 = 0.70;

const SEARCH_DIR: &str = "search_temp";
const MANGA_DIR: &str = "manga_covers";

type PendingLookup = Shared<BoxFuture<'static, String>>;

struct Inner {
    search_dir: PathBuf,
    manga_dir: PathBuf,
    kv: KeyValueStore,
    fetcher: Arc<dyn ImageFetcher>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    max_cache_size: u64,
    index: Arc<RwLock<CacheIndex>>,
    loaded: OnceCell<()>,
    in_flight: Mutex<HashMap<String, PendingLookup>>,
    flush: Debouncer,
}

/// Cheap to clone; clones share state
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("manga_dir", &self.inner.manga_dir)
            .field("max_cache_size", &self.inner.max_cache_size)
            .finish()
    }
}

impl ImageCache {
    pub fn new(config: &EngineConfig, kv: KeyValueStore, fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self::with_parts(config, kv, fetcher, RetryPolicy::from_config(config), Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: &EngineConfig,
        kv: KeyValueStore,
        fetcher: Arc<dyn ImageFetcher>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let root = config.image_cache_dir();
        let index: Arc<RwLock<CacheIndex>> = Arc::default();

        let flush = {
            let (index, kv) = (Arc::clone(&index), kv.clone());
            Debouncer::new(config.metadata_flush_delay(), move || {
                let (index, kv) = (Arc::clone(&index), kv.clone());
                async move {
                    let snapshot = index.read().await.clone();
                    if let Err(e) = kv.set(keys::IMAGE_CACHE_METADATA, &snapshot).await {
                        tracing::warn!(error = %e, "failed to persist image cache metadata");
                    }
                }
            })
        };

        Self {
            inner: Arc::new(Inner {
                search_dir: root.join(SEARCH_DIR),
                manga_dir: root.join(MANGA_DIR),
                kv,
                fetcher,
                retry,
                clock,
                max_cache_size: config.max_image_cache_size,
                index,
                loaded: OnceCell::new(),
                in_flight: Mutex::default(),
                flush,
            }),
        }
    }

    /// Create the cache directories and load the index. Retried on the next call after a failure.
    pub async fn initialize(&self) -> Result<()> {
        self.inner
            .loaded
            .get_or_try_init(|| async {
                for dir in [&self.inner.search_dir, &self.inner.manga_dir] {
                    fs::create_dir_all(dir).await.map_err(|e| {
                        ShelfError::InitializationFailed(format!(
                            "Failed to create image cache directory {}: {}",
                            dir.display(),
                            e
                        ))
                    })?;
                }
                let index = self
                    .inner
                    .kv
                    .get_or_default::<CacheIndex>(keys::IMAGE_CACHE_METADATA)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "failed to load image cache metadata, starting empty");
                        CacheIndex::default()
                    });
                tracing::debug!(entries = index.len(), "image cache loaded");
                *self.inner.index.write().await = index;
                Ok::<(), ShelfError>(())
            })
            .await
            .map(|_| ())
    }

    /// Local path for `url`, downloading it if needed. Falls back to `url` itself.
    pub async fn get_cached_image_path(&self, url: &str, context: CacheContext, manga_id: Option<&str>) -> String {
        if let Err(e) = self.initialize().await {
            tracing::warn!(error = %e, "image cache unavailable");
            return url.to_string();
        }

        let key = cache_key(&hash_url(url), context, manga_id);
        if let Some(path) = self.fresh_hit(&key, url).await {
            return path;
        }

        let lookup = {
            let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            match in_flight.get(&key) {
                Some(pending) => pending.clone(),
                None => {
                    let lookup = Self::spawn_lookup(
                        Arc::clone(&self.inner),
                        key.clone(),
                        url.to_string(),
                        context,
                        manga_id.map(str::to_string),
                    );
                    in_flight.insert(key, lookup.clone());
                    lookup
                }
            }
        };
        lookup.await
    }

    fn spawn_lookup(
        inner: Arc<Inner>,
        key: String,
        url: String,
        context: CacheContext,
        manga_id: Option<String>,
    ) -> PendingLookup {
        async move {
            let result = inner.fetch_entry(&key, &url, context, manga_id.as_deref()).await;
            inner
                .in_flight
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&key);
            match result {
                Ok(path) => path.to_string_lossy().into_owned(),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "image not cached, using remote url");
                    url
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Path of an unexpired entry whose file still exists, touching its access time
    async fn fresh_hit(&self, key: &str, url: &str) -> Option<String> {
        let now = self.inner.clock.now();
        let path = {
            let index = self.inner.index.read().await;
            let entry = index.get(key)?;
            if entry.original_url != url || entry.is_expired(now) {
                return None;
            }
            entry.cached_path.clone()
        };

        if !fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(path = %path.display(), "cached image missing on disk");
            return None;
        }

        if let Some(entry) = self.inner.index.write().await.get_mut(key) {
            entry.last_accessed = now;
        }
        self.inner.flush.schedule();
        Some(path.to_string_lossy().into_owned())
    }

    /// Replace the manga's cached banner when its URL has changed
    pub async fn validate_and_update_cache(&self, manga_id: &str, current_url: &str) -> String {
        if self.initialize().await.is_ok() {
            let stale: Vec<String> = self
                .inner
                .index
                .read()
                .await
                .iter()
                .filter(|(_, e)| {
                    e.context == CacheContext::Manga
                        && e.manga_id.as_deref() == Some(manga_id)
                        && e.original_url != current_url
                })
                .map(|(key, _)| key.clone())
                .collect();
            if !stale.is_empty() {
                tracing::info!(manga_id, replaced = stale.len(), "manga image url changed");
                self.inner.remove_keys(&stale).await;
            }
        }
        self.get_cached_image_path(current_url, CacheContext::Manga, Some(manga_id))
            .await
    }

    pub async fn remove_cached_image(&self, url: &str, context: CacheContext, manga_id: Option<&str>) -> Result<bool> {
        self.initialize().await?;
        let key = cache_key(&hash_url(url), context, manga_id);
        Ok(self.inner.remove_keys(&[key]).await.0 > 0)
    }

    /// Every non-search entry of a manga. Returns the number removed.
    pub async fn clear_manga_cache(&self, manga_id: &str) -> Result<usize> {
        self.initialize().await?;
        let keys = self
            .inner
            .keys_where(|e| !e.context.is_transient() && e.manga_id.as_deref() == Some(manga_id))
            .await;
        Ok(self.inner.remove_keys(&keys).await.0)
    }

    pub async fn clear_search_cache(&self) -> Result<usize> {
        self.initialize().await?;
        let keys = self.inner.keys_where(|e| e.context.is_transient()).await;
        let (removed, _) = self.inner.remove_keys(&keys).await;
        // Files the index lost track of
        clear_dir(&self.inner.search_dir).await?;
        Ok(removed)
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.initialize().await?;
        self.inner.index.write().await.clear();
        for dir in [&self.inner.search_dir, &self.inner.manga_dir] {
            clear_dir(dir).await?;
        }
        self.inner.flush.flush_now().await;
        tracing::info!("image cache cleared");
        Ok(())
    }

    /// Drop entries past their context's TTL. Returns the number removed.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.initialize().await?;
        let now = self.inner.clock.now();
        let keys = self.inner.keys_where(|e| e.is_expired(now)).await;
        let (removed, freed) = self.inner.remove_keys(&keys).await;
        if removed > 0 {
            tracing::info!(removed, freed, "expired cached images removed");
        }
        Ok(removed)
    }

    pub async fn get_cache_stats(&self) -> Result<ImageCacheStats> {
        self.initialize().await?;
        let index = self.inner.index.read().await;
        Ok(ImageCacheStats::from_index(&index, self.inner.max_cache_size))
    }

    /// Write the index now
    pub async fn flush(&self) {
        self.inner.flush.flush_now().await;
    }
}

impl Inner {
    async fn fetch_entry(
        &self,
        key: &str,
        url: &str,
        context: CacheContext,
        manga_id: Option<&str>,
    ) -> Result<PathBuf> {
        let now = self.clock.now();
        let url_hash = hash_url(url);
        let dest = if context.is_transient() {
            self.search_dir
                .join(format!("{}_{}.jpg", url_hash, now.timestamp_millis()))
        } else {
            self.manga_dir.join(format!(
                "{}_{}.jpg",
                sanitize_component(manga_id.unwrap_or("shared")),
                url_hash
            ))
        };
        let temp = dest.with_file_name(format!(".{}.tmp", uuid::Uuid::new_v4()));

        let fetcher = &self.fetcher;
        let temp_ref = temp.as_path();
        let size = retry_with_backoff(&self.retry, url, move |_| fetcher.fetch_to_file(url, temp_ref, None)).await;
        let size = match size {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&temp).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&temp, &dest).await {
            let _ = fs::remove_file(&temp).await;
            return Err(ShelfError::FileIoError(format!(
                "Failed to move cached image into {}: {}",
                dest.display(),
                e
            )));
        }

        let entry = CacheEntry {
            manga_id: manga_id.map(str::to_string),
            original_url: url.to_string(),
            cached_path: dest.clone(),
            last_accessed: now,
            last_updated: now,
            context,
            file_size: size,
            url_hash,
        };
        let replaced = self.index.write().await.insert(key.to_string(), entry);
        if let Some(old) = replaced.filter(|old| old.cached_path != dest) {
            remove_file_quietly(&old.cached_path).await;
        }
        tracing::debug!(url, bytes = size, ?context, "image cached");

        self.flush.schedule();
        if !context.is_transient() {
            self.enforce_size_limit(key).await;
        }

        let still_indexed = self
            .index
            .read()
            .await
            .get(key)
            .is_some_and(|entry| entry.cached_path == dest);
        if !still_indexed {
            return Err(ShelfError::FileIoError(format!(
                "Cached image {} was removed before it could be returned",
                dest.display()
            )));
        }
        Ok(dest)
    }

    async fn keys_where(&self, predicate: impl Fn(&CacheEntry) -> bool) -> Vec<String> {
        self.index
            .read()
            .await
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Remove entries and their files. Returns (entries removed, bytes freed).
    async fn remove_keys(&self, keys: &[String]) -> (usize, u64) {
        let removed: Vec<CacheEntry> = {
            let mut index = self.index.write().await;
            keys.iter().filter_map(|key| index.remove(key)).collect()
        };
        for entry in &removed {
            remove_file_quietly(&entry.cached_path).await;
        }
        if !removed.is_empty() {
            self.flush.schedule();
        }
        (removed.len(), removed.iter().map(|e| e.file_size).sum())
    }

    /// Evict least recently used manga images once the cache passes the high-water mark.
    /// Bookmark, download and search images are never evicted for size, nor is `keep`.
    async fn enforce_size_limit(&self, keep: &str) {
        let victims: Vec<String> = {
            let index = self.index.read().await;
            let total: u64 = index.values().map(|e| e.file_size).sum();
            if (total as f64) <= self.max_cache_size as f64 * EVICTION_HIGH_WATER {
                return;
            }
            let target = (self.max_cache_size as f64 * EVICTION_LOW_WATER) as u64;

            let mut candidates: Vec<(&String, &CacheEntry)> = index
                .iter()
                .filter(|(key, e)| e.context == CacheContext::Manga && key.as_str() != keep)
                .collect();
            candidates.sort_by_key(|(_, e)| e.last_accessed);

            let mut remaining = total;
            let mut victims = Vec::new();
            for (key, entry) in candidates {
                if remaining <= target {
                    break;
                }
                remaining = remaining.saturating_sub(entry.file_size);
                victims.push(key.clone());
            }
            victims
        };

        if victims.is_empty() {
            tracing::warn!("image cache over its size limit with nothing evictable");
            return;
        }
        let (removed, freed) = self.remove_keys(&victims).await;
        tracing::info!(removed, freed, "image cache trimmed for size");
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove cached image");
        }
    }
}

async fn clear_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::create_dir_all(dir).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::net::fetcher::mock::MockFetcher;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        cache: ImageCache,
        fetcher: Arc<MockFetcher>,
        clock: ManualClock,
        kv: KeyValueStore,
    }

    async fn fixture_with(fetcher: MockFetcher, max_cache_size: u64) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut config = EngineConfig::with_root(temp_dir.path());
        config.max_image_cache_size = max_cache_size;
        let kv = KeyValueStore::in_memory().await.unwrap();
        let fetcher = Arc::new(fetcher);
        let clock = ManualClock::new(Utc::now());
        let cache = ImageCache::with_parts(
            &config,
            kv.clone(),
            fetcher.clone(),
            RetryPolicy::immediate(3),
            Arc::new(clock.clone()),
        );
        Fixture {
            temp_dir,
            cache,
            fetcher,
            clock,
            kv,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(MockFetcher::new(100), 1024 * 1024).await
    }

    #[tokio::test]
    async fn test_hit_after_first_download() {
        let f = fixture().await;
        let url = "https://cdn/cover.jpg";

        let first = f.cache.get_cached_image_path(url, CacheContext::Manga, Some("m1")).await;
        assert_ne!(first, url);
        assert!(first.contains("manga_covers"));
        assert!(first.ends_with(&format!("m1_{}.jpg", hash_url(url))));
        assert!(Path::new(&first).exists());

        let second = f.cache.get_cached_image_path(url, CacheContext::Manga, Some("m1")).await;
        assert_eq!(first, second);
        assert_eq!(f.fetcher.calls(url), 1);
    }

    #[tokio::test]
    async fn test_search_images_refresh_after_ttl() {
        let f = fixture().await;
        let url = "https://cdn/thumb.jpg";

        let first = f.cache.get_cached_image_path(url, CacheContext::Search, None).await;
        assert!(first.contains("search_temp"));
        assert!(first.contains(&format!("{}_", hash_url(url))));

        f.clock.advance(ChronoDuration::minutes(30));
        assert_eq!(f.cache.get_cached_image_path(url, CacheContext::Search, None).await, first);

        f.clock.advance(ChronoDuration::minutes(31));
        let refreshed = f.cache.get_cached_image_path(url, CacheContext::Search, None).await;
        assert_ne!(refreshed, first);
        assert!(!Path::new(&first).exists());
        assert_eq!(f.fetcher.calls(url), 2);
    }

    #[tokio::test]
    async fn test_failure_returns_original_url() {
        let f = fixture().await;
        let url = "https://cdn/fail.jpg";
        let path = f.cache.get_cached_image_path(url, CacheContext::Manga, Some("m1")).await;
        assert_eq!(path, url);
        assert_eq!(f.fetcher.calls(url), 3);
        assert_eq!(f.cache.get_cache_stats().await.unwrap().total_entries, 0);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_download() {
        let f = fixture_with(MockFetcher::new(100).with_delay(Duration::from_millis(50)), 1024 * 1024).await;
        let url = "https://cdn/cover.jpg";

        let lookups = (0..5).map(|_| f.cache.get_cached_image_path(url, CacheContext::Manga, Some("m1")));
        let paths = futures_util::future::join_all(lookups).await;

        assert!(paths.iter().all(|p| p == &paths[0]));
        assert_eq!(f.fetcher.calls(url), 1);
    }

    #[tokio::test]
    async fn test_validate_replaces_changed_banner() {
        let f = fixture().await;
        let old = f
            .cache
            .get_cached_image_path("https://cdn/old.jpg", CacheContext::Manga, Some("m1"))
            .await;

        let new = f.cache.validate_and_update_cache("m1", "https://cdn/new.jpg").await;
        assert_ne!(new, old);
        assert!(!Path::new(&old).exists());
        assert!(Path::new(&new).exists());
        assert_eq!(f.cache.get_cache_stats().await.unwrap().persistent_entries, 1);

        // Same URL again is a plain hit
        assert_eq!(f.cache.validate_and_update_cache("m1", "https://cdn/new.jpg").await, new);
        assert_eq!(f.fetcher.calls("https://cdn/new.jpg"), 1);
    }

    #[tokio::test]
    async fn test_size_eviction_spares_bookmarks() {
        // 100 byte images against a 1000 byte limit: eviction at > 850, down to 700
        let f = fixture_with(MockFetcher::new(100), 1000).await;
        f.cache
            .get_cached_image_path("https://cdn/bm.jpg", CacheContext::Bookmark, Some("b"))
            .await;
        f.clock.advance(ChronoDuration::seconds(1));

        let mut paths = Vec::new();
        for i in 0..7 {
            let url = format!("https://cdn/{}.jpg", i);
            paths.push(f.cache.get_cached_image_path(&url, CacheContext::Manga, Some("m1")).await);
            f.clock.advance(ChronoDuration::seconds(1));
        }
        // Eighth manga image takes the cache to 900 bytes
        paths.push(
            f.cache
                .get_cached_image_path("https://cdn/7.jpg", CacheContext::Manga, Some("m1"))
                .await,
        );

        let stats = f.cache.get_cache_stats().await.unwrap();
        assert_eq!(stats.total_size, 700);
        assert!(!Path::new(&paths[0]).exists());
        assert!(!Path::new(&paths[1]).exists());
        assert!(Path::new(&paths[7]).exists());

        let bookmark = f
            .cache
            .get_cached_image_path("https://cdn/bm.jpg", CacheContext::Bookmark, Some("b"))
            .await;
        assert_eq!(f.fetcher.calls("https://cdn/bm.jpg"), 1);
        assert!(Path::new(&bookmark).exists());
    }

    #[tokio::test]
    async fn test_new_image_survives_pressure_from_unevictable_entries() {
        let f = fixture_with(MockFetcher::new(100), 1000).await;
        for i in 0..9 {
            f.cache
                .get_cached_image_path(&format!("https://cdn/bm{}.jpg", i), CacheContext::Bookmark, Some("b"))
                .await;
            f.clock.advance(ChronoDuration::seconds(1));
        }

        let url = "https://cdn/cover.jpg";
        let cover = f.cache.get_cached_image_path(url, CacheContext::Manga, Some("m1")).await;
        assert_ne!(cover, url);
        assert!(Path::new(&cover).exists());

        // A second lookup is a hit on the same file
        assert_eq!(f.cache.get_cached_image_path(url, CacheContext::Manga, Some("m1")).await, cover);
        assert_eq!(f.fetcher.calls(url), 1);
        assert_eq!(f.cache.get_cache_stats().await.unwrap().total_entries, 10);
    }

    #[tokio::test]
    async fn test_cleanup_expired_and_clears() {
        let f = fixture().await;
        f.cache
            .get_cached_image_path("https://cdn/s.jpg", CacheContext::Search, None)
            .await;
        f.cache
            .get_cached_image_path("https://cdn/a.jpg", CacheContext::Manga, Some("m1"))
            .await;
        f.cache
            .get_cached_image_path("https://cdn/b.jpg", CacheContext::Download, Some("m2"))
            .await;

        f.clock.advance(ChronoDuration::hours(2));
        assert_eq!(f.cache.cleanup_expired().await.unwrap(), 1);

        assert_eq!(f.cache.clear_manga_cache("m1").await.unwrap(), 1);
        assert!(f
            .cache
            .remove_cached_image("https://cdn/b.jpg", CacheContext::Download, Some("m2"))
            .await
            .unwrap());
        assert!(!f
            .cache
            .remove_cached_image("https://cdn/b.jpg", CacheContext::Download, Some("m2"))
            .await
            .unwrap());
        assert_eq!(f.cache.get_cache_stats().await.unwrap().total_entries, 0);
    }

    #[tokio::test]
    async fn test_index_persists_across_instances() {
        let f = fixture().await;
        let path = f
            .cache
            .get_cached_image_path("https://cdn/a.jpg", CacheContext::Manga, Some("m1"))
            .await;
        f.cache.flush().await;

        let config = EngineConfig::with_root(f.temp_dir.path());
        let reopened = ImageCache::with_parts(
            &config,
            f.kv.clone(),
            f.fetcher.clone(),
            RetryPolicy::immediate(1),
            Arc::new(f.clock.clone()),
        );
        assert_eq!(
            reopened
                .get_cached_image_path("https://cdn/a.jpg", CacheContext::Manga, Some("m1"))
                .await,
            path
        );
        assert_eq!(f.fetcher.calls("https://cdn/a.jpg"), 1);

        reopened.clear_all().await.unwrap();
        assert!(!Path::new(&path).exists());
        assert_eq!(reopened.get_cache_stats().await.unwrap().total_entries, 0);
    }
}
