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


//! Chapter content store
//!
//! Owns the downloads root: page files, per-chapter `metadata.json`, the
//! in-memory metadata index, usage statistics, and quota enforcement. Index and
//! usage statistics are mirrored to the key-value store through debouncers
//! (2 s and 5 s by default); the page files are the source of truth for sizes.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::content::eviction::{self, EvictionCandidate};
use crate::content::layout::{self, ContentLayout, PageFile};
use crate::content::models::*;
use crate::content::space::{SpaceProbe, SystemSpaceProbe};
use crate::error::{Result, ShelfError};
use crate::events::{DownloadEvent, EventBus};
use crate::net::{retry_with_backoff, ImageFetcher, RetryPolicy};
use crate::settings::SettingsStore;
use crate::storage::{keys, Debouncer, KeyValueStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

/// Progress reported while a chapter is being saved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveProgress {
    /// Resolved page count, reported once before any transfer
    Started { total_pages: usize },
    /// A chunk of this many bytes was written
    Bytes(u64),
    /// A page finished, successfully or not
    PageDone { page_number: u32, success: bool },
}

pub type SaveProgressFn<'a> = &'a (dyn Fn(SaveProgress) + Send + Sync);

#[derive(Debug, Default)]
struct StoreState {
    metadata: MetadataIndex,
    usage: StorageUsageStats,
}

impl StoreState {
    fn get(&self, manga_id: &str, chapter_number: &str) -> Option<&ChapterMetadata> {
        self.metadata.get(manga_id).and_then(|chapters| chapters.get(chapter_number))
    }

    fn insert(&mut self, metadata: ChapterMetadata) {
        self.metadata
            .entry(metadata.manga_id.clone())
            .or_default()
            .insert(metadata.chapter_number.clone(), metadata);
    }

    fn remove(&mut self, manga_id: &str, chapter_number: &str) -> Option<ChapterMetadata> {
        let chapters = self.metadata.get_mut(manga_id)?;
        let removed = chapters.remove(chapter_number);
        if chapters.is_empty() {
            self.metadata.remove(manga_id);
        }
        self.usage.remove(manga_id, chapter_number);
        removed
    }

    fn keys(&self) -> Vec<ChapterKey> {
        self.metadata
            .values()
            .flat_map(|chapters| chapters.values())
            .map(|m| ChapterKey::new(&m.manga_id, &m.chapter_number))
            .collect()
    }
}

/// Sort chapter numbers numerically where possible ("2" before "10", "10.5" after "10")
fn compare_chapter_numbers(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.cmp(b),
    }
}

pub struct ContentStore {
    layout: ContentLayout,
    kv: KeyValueStore,
    settings: Arc<SettingsStore>,
    fetcher: Arc<dyn ImageFetcher>,
    retry: RetryPolicy,
    probe: Arc<dyn SpaceProbe>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    min_free_space: u64,
    state: Arc<RwLock<StoreState>>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    cleanup_lock: Mutex<()>,
    metadata_flush: Debouncer,
    usage_flush: Debouncer,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("root", &self.layout.root())
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .finish()
    }
}

impl ContentStore {
    pub fn new(
        config: &EngineConfig,
        kv: KeyValueStore,
        settings: Arc<SettingsStore>,
        fetcher: Arc<dyn ImageFetcher>,
        events: EventBus,
    ) -> Self {
        let state: Arc<RwLock<StoreState>> = Arc::default();

        let metadata_flush = {
            let (state, kv) = (Arc::clone(&state), kv.clone());
            Debouncer::new(config.metadata_flush_delay(), move || {
                let (state, kv) = (Arc::clone(&state), kv.clone());
                async move {
                    let snapshot = state.read().await.metadata.clone();
                    if let Err(e) = kv.set(keys::CHAPTER_DOWNLOADS_METADATA, &snapshot).await {
                        tracing::warn!(error = %e, "failed to persist chapter metadata");
                    }
                }
            })
        };

        let usage_flush = {
            let (state, kv) = (Arc::clone(&state), kv.clone());
            Debouncer::new(config.usage_stats_flush_delay(), move || {
                let (state, kv) = (Arc::clone(&state), kv.clone());
                async move {
                    let snapshot = state.read().await.usage.clone();
                    if let Err(e) = kv.set(keys::DOWNLOAD_USAGE_STATS, &snapshot).await {
                        tracing::warn!(error = %e, "failed to persist usage stats");
                    }
                }
            })
        };

        Self {
            layout: ContentLayout::new(&config.downloads_root),
            kv,
            settings,
            fetcher,
            retry: RetryPolicy::from_config(config),
            probe: Arc::new(SystemSpaceProbe),
            clock: Arc::new(SystemClock),
            events,
            min_free_space: config.min_free_space,
            state,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            cleanup_lock: Mutex::new(()),
            metadata_flush,
            usage_flush,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn layout(&self) -> &ContentLayout {
        &self.layout
    }

    /// Create the downloads root and load persisted state. Idempotent.
    ///
    /// Failing to create the root is fatal: the store stays uninitialized and
    /// the next call tries again.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = fs::create_dir_all(self.layout.root()).await {
            self.initialized.store(false, Ordering::SeqCst);
            tracing::error!(root = %self.layout.root().display(), error = %e, "cannot create downloads root");
            return Err(ShelfError::InitializationFailed(format!(
                "Failed to create downloads directory {}: {}",
                self.layout.root().display(),
                e
            )));
        }

        let metadata = self
            .kv
            .get_or_default::<MetadataIndex>(keys::CHAPTER_DOWNLOADS_METADATA)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load chapter metadata, starting empty");
                MetadataIndex::default()
            });
        let usage = self
            .kv
            .get_or_default::<StorageUsageStats>(keys::DOWNLOAD_USAGE_STATS)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load usage stats, starting empty");
                StorageUsageStats::default()
            });

        {
            let mut state = self.state.write().await;
            state.metadata = metadata;
            state.usage = usage;
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(root = %self.layout.root().display(), "content store initialized");
        Ok(())
    }

    pub async fn save_chapter_images(
        &self,
        manga_id: &str,
        chapter_number: &str,
        pages: &[PageRequest],
    ) -> Result<ChapterMetadata> {
        self.save_chapter_images_with_progress(manga_id, chapter_number, pages, None)
            .await
    }

    /// Download every page not already on disk and record the chapter
    ///
    /// Pages that fail after retries are logged and skipped. The chapter is
    /// saved when at least one page is on disk; otherwise the call fails.
    pub async fn save_chapter_images_with_progress(
        &self,
        manga_id: &str,
        chapter_number: &str,
        pages: &[PageRequest],
        on_progress: Option<SaveProgressFn<'_>>,
    ) -> Result<ChapterMetadata> {
        self.initialize().await?;

        let report = |progress: SaveProgress| {
            if let Some(callback) = on_progress {
                callback(progress);
            }
        };
        report(SaveProgress::Started {
            total_pages: pages.len(),
        });

        let dir = self.layout.chapter_dir(manga_id, chapter_number);
        fs::create_dir_all(&dir).await.map_err(|e| {
            ShelfError::FileIoError(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let on_bytes = |bytes: u64| report(SaveProgress::Bytes(bytes));
        let mut images = Vec::with_capacity(pages.len());
        let mut newly_downloaded = 0u64;

        for page in pages {
            let outcome = match self.layout.find_page(manga_id, chapter_number, page.page_number).await {
                Some(existing) => Ok((existing, false)),
                None => self
                    .download_page(manga_id, chapter_number, page, &on_bytes)
                    .await,
            };

            match outcome {
                Ok((file, fresh)) => {
                    if fresh {
                        newly_downloaded += file.size;
                    }
                    images.push(ChapterImage {
                        page_number: page.page_number,
                        original_url: page.original_url.clone(),
                        local_path: file.path,
                        download_status: ImageStatus::Completed,
                        file_size: file.size,
                    });
                    report(SaveProgress::PageDone {
                        page_number: page.page_number,
                        success: true,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        manga_id,
                        chapter = chapter_number,
                        page = page.page_number,
                        error = %e,
                        "skipping page that failed to download"
                    );
                    let ext = layout::extension_for_url(&page.original_url);
                    images.push(ChapterImage {
                        page_number: page.page_number,
                        original_url: page.original_url.clone(),
                        local_path: self.layout.page_path(manga_id, chapter_number, page.page_number, ext),
                        download_status: ImageStatus::Failed,
                        file_size: 0,
                    });
                    report(SaveProgress::PageDone {
                        page_number: page.page_number,
                        success: false,
                    });
                }
            }
        }

        images.sort_by_key(|image| image.page_number);
        let completed: Vec<&ChapterImage> = images
            .iter()
            .filter(|image| image.download_status == ImageStatus::Completed)
            .collect();

        if completed.is_empty() {
            // Leave nothing behind for a chapter that never materialized
            if self.state.read().await.get(manga_id, chapter_number).is_none() {
                let _ = self.layout.remove_chapter(manga_id, chapter_number).await;
            }
            return Err(ShelfError::DownloadFailed(format!(
                "No pages of chapter {} of manga {} could be downloaded",
                chapter_number, manga_id
            )));
        }

        let metadata = ChapterMetadata {
            manga_id: manga_id.to_string(),
            chapter_number: chapter_number.to_string(),
            downloaded_at: self.clock.now(),
            total_images: completed.len(),
            total_size: completed.iter().map(|image| image.file_size).sum(),
            schema_version: METADATA_SCHEMA_VERSION,
            images: images.clone(),
        };
        self.write_metadata_file(&metadata).await?;

        {
            let mut state = self.state.write().await;
            state.insert(metadata.clone());
            state.usage.total_downloads_ever += 1;
            state.usage.total_size_downloaded_ever += newly_downloaded;
        }
        self.metadata_flush.schedule();
        self.usage_flush.schedule();

        tracing::info!(
            manga_id,
            chapter = chapter_number,
            pages = metadata.total_images,
            bytes = metadata.total_size,
            "chapter saved"
        );

        let key = ChapterKey::new(manga_id, chapter_number);
        match self.check_storage_quota().await {
            Ok(report) if report.deleted.contains(&key) => {
                tracing::warn!(
                    manga_id,
                    chapter = chapter_number,
                    bytes = metadata.total_size,
                    "chapter did not fit and was removed by storage cleanup"
                );
                let settings = self.settings.get().await;
                return Err(ShelfError::InsufficientDiskSpace {
                    need: metadata.total_size,
                    have: settings.max_storage_size,
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "storage quota check failed"),
        }

        Ok(metadata)
    }

    /// Fetch one page through a temp file. The bool is false when another
    /// writer got the page in place first and its file was kept.
    async fn download_page(
        &self,
        manga_id: &str,
        chapter_number: &str,
        page: &PageRequest,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<(PageFile, bool)> {
        let ext = layout::extension_for_url(&page.original_url);
        let dest = self.layout.page_path(manga_id, chapter_number, page.page_number, ext);
        let temp = layout::temp_path_for(&dest);

        let fetcher = &self.fetcher;
        let url = page.original_url.as_str();
        let temp_ref = temp.as_path();
        let label = format!("{}/{}/page {}", manga_id, chapter_number, page.page_number);
        let size = retry_with_backoff(&self.retry, &label, move |_| {
            fetcher.fetch_to_file(url, temp_ref, Some(on_bytes))
        })
        .await?;

        if let Some(existing) = self.layout.find_page(manga_id, chapter_number, page.page_number).await {
            let _ = fs::remove_file(&temp).await;
            return Ok((existing, false));
        }

        if let Err(e) = fs::rename(&temp, &dest).await {
            let _ = fs::remove_file(&temp).await;
            return Err(ShelfError::FileIoError(format!(
                "Failed to move page into {}: {}",
                dest.display(),
                e
            )));
        }

        Ok((
            PageFile {
                page_number: page.page_number,
                path: dest,
                size,
            },
            true,
        ))
    }

    async fn write_metadata_file(&self, metadata: &ChapterMetadata) -> Result<()> {
        let path = self.layout.metadata_path(&metadata.manga_id, &metadata.chapter_number);
        let json = serde_json::to_vec_pretty(metadata)?;
        layout::atomic_write(&path, &json).await
    }

    async fn read_metadata_file(&self, manga_id: &str, chapter_number: &str) -> Option<ChapterMetadata> {
        let path = self.layout.metadata_path(manga_id, chapter_number);
        let bytes = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable chapter metadata");
                None
            }
        }
    }

    /// Pages of a downloaded chapter, sorted by page number
    ///
    /// `None` when the chapter has no `metadata.json`. Metadata that disagrees
    /// with the files on disk is repaired; a chapter with no pages left is purged.
    pub async fn get_chapter_images(
        &self,
        manga_id: &str,
        chapter_number: &str,
    ) -> Result<Option<Vec<ChapterImage>>> {
        self.initialize().await?;

        let metadata_path = self.layout.metadata_path(manga_id, chapter_number);
        if !fs::try_exists(&metadata_path).await.unwrap_or(false) {
            if self.state.write().await.remove(manga_id, chapter_number).is_some() {
                tracing::debug!(manga_id, chapter = chapter_number, "purged metadata without a metadata file");
                self.metadata_flush.schedule();
                self.usage_flush.schedule();
            }
            return Ok(None);
        }

        let known = self.state.read().await.get(manga_id, chapter_number).cloned();
        let metadata = match known {
            Some(metadata) => Some(metadata),
            None => self.read_metadata_file(manga_id, chapter_number).await,
        };

        let pages = self.layout.list_pages(manga_id, chapter_number).await?;
        if pages.is_empty() {
            tracing::warn!(manga_id, chapter = chapter_number, "chapter has metadata but no pages, purging");
            self.purge_chapter(manga_id, chapter_number).await?;
            return Ok(None);
        }

        let images: Vec<ChapterImage> = pages
            .iter()
            .map(|page| ChapterImage {
                page_number: page.page_number,
                original_url: metadata
                    .as_ref()
                    .and_then(|m| m.original_url(page.page_number))
                    .unwrap_or_default()
                    .to_string(),
                local_path: page.path.clone(),
                download_status: ImageStatus::Completed,
                file_size: page.size,
            })
            .collect();

        let total_size: u64 = pages.iter().map(|page| page.size).sum();
        let needs_repair = match &metadata {
            Some(m) => m.total_images != pages.len() || m.total_size != total_size,
            None => true,
        };

        let now = self.clock.now();
        if needs_repair {
            let repaired = ChapterMetadata {
                manga_id: manga_id.to_string(),
                chapter_number: chapter_number.to_string(),
                downloaded_at: metadata.as_ref().map(|m| m.downloaded_at).unwrap_or(now),
                total_images: pages.len(),
                total_size,
                schema_version: METADATA_SCHEMA_VERSION,
                images: images.clone(),
            };
            tracing::info!(
                manga_id,
                chapter = chapter_number,
                expected = metadata.as_ref().map(|m| m.total_images).unwrap_or(0),
                found = pages.len(),
                "repairing chapter metadata"
            );
            self.write_metadata_file(&repaired).await?;
            self.state.write().await.insert(repaired);
            self.metadata_flush.schedule();
        } else if let Some(m) = metadata {
            let mut state = self.state.write().await;
            if state.get(manga_id, chapter_number).is_none() {
                state.insert(m);
                self.metadata_flush.schedule();
            }
        }

        self.state
            .write()
            .await
            .usage
            .record_access(manga_id, chapter_number, now);
        self.usage_flush.schedule();

        Ok(Some(images))
    }

    async fn purge_chapter(&self, manga_id: &str, chapter_number: &str) -> Result<Option<ChapterMetadata>> {
        let removed = self.state.write().await.remove(manga_id, chapter_number);
        self.layout.remove_chapter(manga_id, chapter_number).await?;
        self.metadata_flush.schedule();
        self.usage_flush.schedule();
        Ok(removed)
    }

    /// Remove a chapter's files and records. Returns false (and emits nothing)
    /// when there was nothing to delete.
    pub async fn delete_chapter(&self, manga_id: &str, chapter_number: &str) -> Result<bool> {
        self.initialize().await?;

        let removed = self.state.write().await.remove(manga_id, chapter_number);
        let existed_on_disk = self.layout.remove_chapter(manga_id, chapter_number).await?;

        if removed.is_none() && !existed_on_disk {
            return Ok(false);
        }

        self.metadata_flush.schedule();
        self.usage_flush.schedule();
        tracing::info!(manga_id, chapter = chapter_number, "chapter deleted");

        self.events.publish(DownloadEvent::Deleted {
            manga_id: manga_id.to_string(),
            chapter_number: chapter_number.to_string(),
        });
        Ok(true)
    }

    pub async fn is_chapter_downloaded(&self, manga_id: &str, chapter_number: &str) -> Result<bool> {
        self.initialize().await?;
        if self.state.read().await.get(manga_id, chapter_number).is_none() {
            return Ok(false);
        }
        Ok(fs::try_exists(self.layout.metadata_path(manga_id, chapter_number))
            .await
            .unwrap_or(false))
    }

    /// Chapter numbers of a manga, in numeric order
    pub async fn get_downloaded_chapters(&self, manga_id: &str) -> Result<Vec<String>> {
        self.initialize().await?;
        let mut chapters: Vec<String> = self
            .state
            .read()
            .await
            .metadata
            .get(manga_id)
            .map(|chapters| chapters.keys().cloned().collect())
            .unwrap_or_default();
        chapters.sort_by(|a, b| compare_chapter_numbers(a, b));
        Ok(chapters)
    }

    /// Bytes on disk for all of a manga's chapters
    pub async fn get_manga_download_size(&self, manga_id: &str) -> Result<u64> {
        let mut total = 0;
        for chapter in self.get_downloaded_chapters(manga_id).await? {
            total += self.chapter_size_on_disk(manga_id, &chapter).await;
        }
        Ok(total)
    }

    pub async fn get_chapter_metadata(&self, manga_id: &str, chapter_number: &str) -> Result<Option<ChapterMetadata>> {
        self.initialize().await?;
        Ok(self.state.read().await.get(manga_id, chapter_number).cloned())
    }

    async fn chapter_size_on_disk(&self, manga_id: &str, chapter_number: &str) -> u64 {
        match self.layout.list_pages(manga_id, chapter_number).await {
            Ok(pages) => pages.iter().map(|page| page.size).sum(),
            Err(e) => {
                tracing::warn!(manga_id, chapter = chapter_number, error = %e, "cannot scan chapter");
                0
            }
        }
    }

    /// Every stored chapter with its on-disk size and usage figures
    async fn collect_candidates(&self) -> Vec<EvictionCandidate> {
        let snapshot: Vec<(ChapterKey, chrono::DateTime<chrono::Utc>, Option<chrono::DateTime<chrono::Utc>>, u64)> = {
            let state = self.state.read().await;
            state
                .keys()
                .into_iter()
                .filter_map(|key| {
                    let metadata = state.get(&key.manga_id, &key.chapter_number)?;
                    let last_access = state.usage.last_access(&key.manga_id, &key.chapter_number);
                    let count = state.usage.access_count(&key.manga_id, &key.chapter_number);
                    Some((key, metadata.downloaded_at, last_access, count))
                })
                .collect()
        };

        let mut candidates = Vec::with_capacity(snapshot.len());
        for (key, downloaded_at, last_access, access_count) in snapshot {
            let size = self.chapter_size_on_disk(&key.manga_id, &key.chapter_number).await;
            candidates.push(EvictionCandidate {
                manga_id: key.manga_id,
                chapter_number: key.chapter_number,
                size,
                last_access,
                access_count,
                downloaded_at,
            });
        }
        candidates
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats> {
        self.initialize().await?;
        let settings = self.settings.get().await;
        let candidates = self.collect_candidates().await;
        Ok(self.stats_from(&candidates, settings.max_storage_size))
    }

    fn stats_from(&self, candidates: &[EvictionCandidate], max_storage_size: u64) -> StorageStats {
        let total_size: u64 = candidates.iter().map(|c| c.size).sum();
        let manga_count = candidates
            .iter()
            .map(|c| c.manga_id.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        let available_space = max_storage_size.saturating_sub(total_size);
        let device_free_space = self
            .probe
            .free_space(self.layout.root())
            .unwrap_or(available_space);

        StorageStats {
            total_size,
            total_chapters: candidates.len(),
            manga_count,
            available_space,
            device_free_space,
            oldest_download: candidates.iter().map(|c| c.downloaded_at).min(),
        }
    }

    pub async fn get_detailed_storage_stats(&self) -> Result<DetailedStorageStats> {
        self.initialize().await?;
        let settings = self.settings.get().await;
        let candidates = self.collect_candidates().await;
        let stats = self.stats_from(&candidates, settings.max_storage_size);

        let mut by_manga: BTreeMap<&str, MangaStorage> = BTreeMap::new();
        for candidate in &candidates {
            let entry = by_manga
                .entry(candidate.manga_id.as_str())
                .or_insert_with(|| MangaStorage {
                    manga_id: candidate.manga_id.clone(),
                    chapter_count: 0,
                    total_size: 0,
                });
            entry.chapter_count += 1;
            entry.total_size += candidate.size;
        }
        let mut per_manga: Vec<MangaStorage> = by_manga.into_values().collect();
        per_manga.sort_by(|a, b| b.total_size.cmp(&a.total_size));

        let usage_percent = if settings.max_storage_size > 0 {
            stats.total_size as f64 / settings.max_storage_size as f64 * 100.0
        } else {
            0.0
        };

        let usage = self.state.read().await.usage.clone();
        Ok(DetailedStorageStats {
            stats,
            max_storage_size: settings.max_storage_size,
            usage_percent,
            warning: usage_percent >= f64::from(settings.storage_warning_threshold_percent),
            per_manga,
            last_cleanup: usage.last_cleanup,
            total_downloads_ever: usage.total_downloads_ever,
            total_size_downloaded_ever: usage.total_size_downloaded_ever,
        })
    }

    async fn evict(&self, victims: Vec<EvictionCandidate>, reason: &str) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for victim in victims {
            if self.delete_chapter(&victim.manga_id, &victim.chapter_number).await? {
                tracing::info!(
                    manga_id = %victim.manga_id,
                    chapter = %victim.chapter_number,
                    bytes = victim.size,
                    reason,
                    "evicted chapter"
                );
                report.freed_bytes += victim.size;
                report.deleted.push(ChapterKey::new(victim.manga_id, victim.chapter_number));
            }
        }
        Ok(report)
    }

    async fn record_cleanup(&self) {
        self.state.write().await.usage.last_cleanup = Some(self.clock.now());
        self.usage_flush.schedule();
    }

    /// Enforce the quota and the device free-space floor
    pub async fn check_storage_quota(&self) -> Result<CleanupReport> {
        self.initialize().await?;
        let _guard = self.cleanup_lock.lock().await;
        self.check_storage_quota_locked().await
    }

    async fn check_storage_quota_locked(&self) -> Result<CleanupReport> {
        let settings = self.settings.get().await;
        let candidates = self.collect_candidates().await;
        let total: u64 = candidates.iter().map(|c| c.size).sum();

        let mut report = CleanupReport::default();
        let mut ran = false;

        if let Some(victims) = eviction::intelligent_plan(candidates, total, settings.max_storage_size) {
            ran = true;
            tracing::info!(total, quota = settings.max_storage_size, "usage above threshold, running intelligent cleanup");
            report.merge(self.evict(victims, "quota").await?);
        }

        if let Some(free) = self.probe.free_space(self.layout.root()) {
            let remaining = self.collect_candidates().await;
            if let Some(victims) = eviction::aggressive_plan(remaining, free, self.min_free_space) {
                ran = true;
                tracing::warn!(free, floor = self.min_free_space, "device space low, running aggressive cleanup");
                report.merge(self.evict(victims, "device space").await?);
            }
        }

        if ran {
            self.record_cleanup().await;
        }
        Ok(report)
    }

    /// Remove chapters idle longer than `auto_cleanup_days` (when enabled), then enforce the quota
    pub async fn cleanup_old_downloads(&self) -> Result<CleanupReport> {
        self.initialize().await?;
        let _guard = self.cleanup_lock.lock().await;
        let settings = self.settings.get().await;

        let mut report = CleanupReport::default();
        if settings.auto_cleanup_enabled {
            let cutoff = self.clock.now() - chrono::Duration::days(i64::from(settings.auto_cleanup_days));
            let victims: Vec<EvictionCandidate> = self
                .collect_candidates()
                .await
                .into_iter()
                .filter(|c| c.idle_since() < cutoff)
                .collect();
            if !victims.is_empty() {
                report.merge(self.evict(victims, "idle").await?);
            }
            self.record_cleanup().await;
        }

        report.merge(self.check_storage_quota_locked().await?);
        Ok(report)
    }

    /// User-triggered cleanup over the chapters matching `options`
    pub async fn perform_manual_cleanup(&self, options: ManualCleanupOptions) -> Result<CleanupReport> {
        if options.is_empty() {
            return Err(ShelfError::invalid_input(
                "manual cleanup needs older_than_days, manga_id or target_size",
            ));
        }
        self.initialize().await?;
        let _guard = self.cleanup_lock.lock().await;

        let all = self.collect_candidates().await;
        let total: u64 = all.iter().map(|c| c.size).sum();

        let cutoff = options
            .older_than_days
            .map(|days| self.clock.now() - chrono::Duration::days(i64::from(days)));
        let mut matching: Vec<EvictionCandidate> = all
            .into_iter()
            .filter(|c| options.manga_id.as_deref().map_or(true, |id| c.manga_id == id))
            .filter(|c| cutoff.map_or(true, |cutoff| c.idle_since() < cutoff))
            .collect();

        let victims = match options.target_size {
            Some(target) => {
                eviction::sort_least_valuable_first(&mut matching);
                eviction::take_until_within(matching, total, target)
            }
            None => matching,
        };

        let report = self.evict(victims, "manual").await?;
        self.record_cleanup().await;
        tracing::info!(deleted = report.deleted.len(), freed = report.freed_bytes, "manual cleanup finished");
        Ok(report)
    }

    /// Write pending metadata and usage statistics now
    pub async fn flush(&self) {
        self.metadata_flush.flush_now().await;
        self.usage_flush.flush_now().await;
    }

    /// Downloaded chapters grouped by manga
    pub async fn list_all(&self) -> Result<HashMap<String, Vec<String>>> {
        self.initialize().await?;
        let state = self.state.read().await;
        Ok(state
            .metadata
            .iter()
            .map(|(manga_id, chapters)| {
                let mut numbers: Vec<String> = chapters.keys().cloned().collect();
                numbers.sort_by(|a, b| compare_chapter_numbers(a, b));
                (manga_id.clone(), numbers)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::content::space::FixedSpaceProbe;
    use crate::net::fetcher::mock::MockFetcher;
    use crate::settings::DownloadSettingsUpdate;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        store: ContentStore,
        kv: KeyValueStore,
        clock: ManualClock,
        probe: Arc<FixedSpaceProbe>,
        fetcher: Arc<MockFetcher>,
        events: EventBus,
        settings: Arc<SettingsStore>,
        config: EngineConfig,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig {
            min_free_space: 200,
            ..EngineConfig::with_root(temp_dir.path())
        };
        let kv = KeyValueStore::in_memory().await.unwrap();
        let settings = Arc::new(SettingsStore::new(kv.clone()));
        let fetcher = Arc::new(MockFetcher::new(100));
        let events = EventBus::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
        let probe = Arc::new(FixedSpaceProbe::new(None));

        let store = ContentStore::new(&config, kv.clone(), Arc::clone(&settings), fetcher.clone(), events.clone())
            .with_clock(Arc::new(clock.clone()))
            .with_space_probe(probe.clone())
            .with_retry_policy(RetryPolicy::immediate(3));

        Fixture {
            _temp_dir: temp_dir,
            store,
            kv,
            clock,
            probe,
            fetcher,
            events,
            settings,
            config,
        }
    }

    fn pages(chapter: &str, numbers: &[u32]) -> Vec<PageRequest> {
        numbers
            .iter()
            .map(|n| PageRequest::new(*n, format!("https://cdn.example.com/{}/{}.jpg", chapter, n)))
            .collect()
    }

    #[tokio::test]
    async fn test_save_then_read_sorted() {
        let f = fixture().await;
        let metadata = f.store.save_chapter_images("m1", "1", &pages("1", &[3, 1, 2])).await.unwrap();
        assert_eq!(metadata.total_images, 3);
        assert_eq!(metadata.total_size, 300);

        let images = f.store.get_chapter_images("m1", "1").await.unwrap().unwrap();
        let numbers: Vec<u32> = images.iter().map(|i| i.page_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(images.iter().all(|i| i.local_path.exists()));
        assert_eq!(images[0].original_url, "https://cdn.example.com/1/1.jpg");
        assert!(f.store.is_chapter_downloaded("m1", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_existing_pages_are_reused() {
        let f = fixture().await;
        f.store.save_chapter_images("m1", "1", &pages("1", &[1, 2])).await.unwrap();
        f.store.save_chapter_images("m1", "1", &pages("1", &[1, 2, 3])).await.unwrap();

        assert_eq!(f.fetcher.calls("https://cdn.example.com/1/1.jpg"), 1);
        assert_eq!(f.fetcher.calls("https://cdn.example.com/1/3.jpg"), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_still_saves() {
        let f = fixture().await;
        let mut requests = pages("1", &[1, 2]);
        requests.push(PageRequest::new(3, "https://cdn.example.com/fail/3.jpg"));

        let progress_pages = std::sync::Mutex::new(Vec::new());
        let callback = |p: SaveProgress| {
            if let SaveProgress::PageDone { page_number, success } = p {
                progress_pages.lock().unwrap().push((page_number, success));
            }
        };
        let metadata = f
            .store
            .save_chapter_images_with_progress("m1", "1", &requests, Some(&callback))
            .await
            .unwrap();

        assert_eq!(metadata.total_images, 2);
        assert_eq!(metadata.images.len(), 3);
        assert_eq!(metadata.images[2].download_status, ImageStatus::Failed);
        // Three attempts for the failing page
        assert_eq!(f.fetcher.calls("https://cdn.example.com/fail/3.jpg"), 3);
        assert_eq!(
            *progress_pages.lock().unwrap(),
            vec![(1, true), (2, true), (3, false)]
        );
    }

    #[tokio::test]
    async fn test_all_pages_failing_is_an_error() {
        let f = fixture().await;
        let requests = vec![PageRequest::new(1, "https://cdn.example.com/fail/1.jpg")];

        let result = f.store.save_chapter_images("m1", "1", &requests).await;
        assert!(matches!(result, Err(ShelfError::DownloadFailed(_))));
        assert!(!f.store.layout().chapter_dir("m1", "1").exists());
        assert!(!f.store.is_chapter_downloaded("m1", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_emits_once() {
        let f = fixture().await;
        let mut rx = f.events.subscribe();
        f.store.save_chapter_images("m1", "1", &pages("1", &[1])).await.unwrap();

        assert!(f.store.delete_chapter("m1", "1").await.unwrap());
        assert!(!f.store.is_chapter_downloaded("m1", "1").await.unwrap());
        assert!(!f.store.layout().manga_dir("m1").exists());

        assert!(!f.store.delete_chapter("m1", "1").await.unwrap());

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, DownloadEvent::Deleted { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_metadata_file_returns_none() {
        let f = fixture().await;
        assert!(f.store.get_chapter_images("m1", "404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repair_on_read() {
        let f = fixture().await;
        f.store.save_chapter_images("m1", "1", &pages("1", &[1, 2, 3])).await.unwrap();

        let gone = f.store.layout().page_path("m1", "1", 2, "jpg");
        fs::remove_file(&gone).await.unwrap();

        let images = f.store.get_chapter_images("m1", "1").await.unwrap().unwrap();
        assert_eq!(images.len(), 2);
        let metadata = f.store.get_chapter_metadata("m1", "1").await.unwrap().unwrap();
        assert_eq!(metadata.total_images, 2);
        assert_eq!(metadata.total_size, 200);

        for n in [1, 3] {
            fs::remove_file(f.store.layout().page_path("m1", "1", n, "jpg")).await.unwrap();
        }
        assert!(f.store.get_chapter_images("m1", "1").await.unwrap().is_none());
        assert!(!f.store.is_chapter_downloaded("m1", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_evicts_least_recently_used() {
        let f = fixture().await;
        f.settings
            .update(DownloadSettingsUpdate {
                max_storage_size: Some(1_000),
                ..Default::default()
            })
            .await
            .unwrap();

        for chapter in 1..=8 {
            f.clock.advance(chrono::Duration::minutes(1));
            let ch = chapter.to_string();
            f.store.save_chapter_images("m1", &ch, &pages(&ch, &[1])).await.unwrap();
        }
        // Chapter 1 is the oldest download but was just read
        f.clock.advance(chrono::Duration::minutes(1));
        f.store.get_chapter_images("m1", "1").await.unwrap().unwrap();

        f.clock.advance(chrono::Duration::minutes(1));
        f.store.save_chapter_images("m1", "9", &pages("9", &[1])).await.unwrap();

        let stats = f.store.get_storage_stats().await.unwrap();
        assert!(stats.total_size <= 700);
        assert!(f.store.is_chapter_downloaded("m1", "1").await.unwrap());
        assert!(!f.store.is_chapter_downloaded("m1", "2").await.unwrap());
        assert!(!f.store.is_chapter_downloaded("m1", "3").await.unwrap());
        assert!(f.store.is_chapter_downloaded("m1", "9").await.unwrap());

        let detailed = f.store.get_detailed_storage_stats().await.unwrap();
        assert_eq!(detailed.last_cleanup, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn test_chapter_larger_than_quota_is_reported() {
        let f = fixture().await;
        f.settings
            .update(DownloadSettingsUpdate {
                max_storage_size: Some(150),
                ..Default::default()
            })
            .await
            .unwrap();

        let result = f.store.save_chapter_images("m1", "1", &pages("1", &[1, 2])).await;
        assert!(matches!(
            result,
            Err(ShelfError::InsufficientDiskSpace { need: 200, have: 150 })
        ));
        assert!(!f.store.is_chapter_downloaded("m1", "1").await.unwrap());
        assert!(f.store.get_chapter_images("m1", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_aggressive_cleanup_when_device_is_full() {
        let f = fixture().await;
        for chapter in 1..=3 {
            f.clock.advance(chrono::Duration::minutes(1));
            let ch = chapter.to_string();
            f.store.save_chapter_images("m1", &ch, &pages(&ch, &[1])).await.unwrap();
        }
        // Newest-read does not matter here
        f.store.get_chapter_images("m1", "1").await.unwrap();

        f.probe.set(Some(50));
        let report = f.store.check_storage_quota().await.unwrap();
        let deleted: Vec<&str> = report.deleted.iter().map(|k| k.chapter_number.as_str()).collect();
        assert_eq!(deleted, vec!["1", "2"]);
        assert_eq!(report.freed_bytes, 200);
        assert_eq!(f.config.min_free_space, 200);
    }

    #[tokio::test]
    async fn test_manual_cleanup_by_manga() {
        let f = fixture().await;
        f.store.save_chapter_images("m1", "1", &pages("a", &[1])).await.unwrap();
        f.store.save_chapter_images("m2", "1", &pages("b", &[1])).await.unwrap();

        assert!(f.store.perform_manual_cleanup(ManualCleanupOptions::default()).await.is_err());

        let report = f
            .store
            .perform_manual_cleanup(ManualCleanupOptions {
                manga_id: Some("m1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.deleted, vec![ChapterKey::new("m1", "1")]);
        assert!(f.store.is_chapter_downloaded("m2", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_manual_cleanup_to_target_size() {
        let f = fixture().await;
        for chapter in 1..=4 {
            f.clock.advance(chrono::Duration::minutes(1));
            let ch = chapter.to_string();
            f.store.save_chapter_images("m1", &ch, &pages(&ch, &[1])).await.unwrap();
        }
        let report = f
            .store
            .perform_manual_cleanup(ManualCleanupOptions {
                target_size: Some(250),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(f.store.get_storage_stats().await.unwrap().total_size, 200);
    }

    #[tokio::test]
    async fn test_cleanup_old_downloads() {
        let f = fixture().await;
        f.store.save_chapter_images("m1", "1", &pages("1", &[1])).await.unwrap();
        f.store.save_chapter_images("m1", "2", &pages("2", &[1])).await.unwrap();

        // Disabled: nothing happens
        f.clock.advance(chrono::Duration::days(40));
        assert!(f.store.cleanup_old_downloads().await.unwrap().is_empty());

        f.settings
            .update(DownloadSettingsUpdate {
                auto_cleanup_enabled: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        f.store.get_chapter_images("m1", "2").await.unwrap();

        let report = f.store.cleanup_old_downloads().await.unwrap();
        assert_eq!(report.deleted, vec![ChapterKey::new("m1", "1")]);
    }

    #[tokio::test]
    async fn test_stats_follow_disk() {
        let f = fixture().await;
        f.store.save_chapter_images("m1", "1", &pages("1", &[1, 2])).await.unwrap();
        f.store.save_chapter_images("m2", "5", &pages("5", &[1])).await.unwrap();

        let stats = f.store.get_storage_stats().await.unwrap();
        assert_eq!(stats.total_size, 300);
        assert_eq!(stats.total_chapters, 2);
        assert_eq!(stats.manga_count, 2);
        // Probe unavailable: falls back to quota remainder
        assert_eq!(stats.device_free_space, stats.available_space);
        assert_eq!(f.store.get_manga_download_size("m1").await.unwrap(), 200);

        f.probe.set(Some(1_000_000));
        let stats = f.store.get_storage_stats().await.unwrap();
        assert_eq!(stats.device_free_space, 1_000_000);
    }

    #[tokio::test]
    async fn test_downloaded_chapters_in_numeric_order() {
        let f = fixture().await;
        for ch in ["10", "2", "10.5", "1"] {
            f.store.save_chapter_images("m1", ch, &pages(ch, &[1])).await.unwrap();
        }
        assert_eq!(
            f.store.get_downloaded_chapters("m1").await.unwrap(),
            vec!["1", "2", "10", "10.5"]
        );
    }

    #[tokio::test]
    async fn test_flush_persists_index() {
        let f = fixture().await;
        f.store.save_chapter_images("m1", "1", &pages("1", &[1])).await.unwrap();
        f.store.flush().await;

        let index: MetadataIndex = f.kv.get(keys::CHAPTER_DOWNLOADS_METADATA).await.unwrap().unwrap();
        assert_eq!(index["m1"]["1"].total_images, 1);

        let reopened = ContentStore::new(
            &f.config,
            f.kv.clone(),
            Arc::clone(&f.settings),
            f.fetcher.clone(),
            EventBus::new(),
        );
        assert!(reopened.is_chapter_downloaded("m1", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_initialize_failure_is_fatal_and_retryable() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"x").unwrap();

        let config = EngineConfig {
            downloads_root: blocker.join("downloads"),
            ..EngineConfig::with_root(temp_dir.path())
        };
        let kv = KeyValueStore::in_memory().await.unwrap();
        let store = ContentStore::new(
            &config,
            kv.clone(),
            Arc::new(SettingsStore::new(kv)),
            Arc::new(MockFetcher::new(1)),
            EventBus::new(),
        );

        assert!(matches!(store.initialize().await, Err(ShelfError::InitializationFailed(_))));
        assert!(store.get_storage_stats().await.is_err());
    }
}
