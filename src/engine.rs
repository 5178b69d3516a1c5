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


//! Engine assembly
//!
//! [`Engine`] builds every component exactly once, hands each its
//! collaborators, and owns the background tasks:
//!
//! - the download manager's scheduling loop
//! - the batch orchestrator, fed by its own event receiver
//! - the status cache invalidation loop
//!
//! Hosts hold one engine per process. Everything is reachable through its
//! accessors; there are no globals below this level.
//!
//! # Usage Example
//! ```no_run
//! use mangashelf_core::{config::EngineConfig, engine::Engine};
//!
//! # async fn example() -> mangashelf_core::Result<()> {
//! let engine = Engine::builder(EngineConfig::from_env()).build().await?;
//! engine.start().await?;
//! engine.queue().add_to_queue("manga-1", "12", "https://example.org/m/1/12").await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::content::{CleanupReport, ContentStore, SpaceProbe};
use crate::download::{
    BatchDownloadOrchestrator, ChapterSource, DownloadManager, DownloadQueue, DownloadStatusService,
    RegisteredPagesSource,
};
use crate::error::{Result, ShelfError};
use crate::events::EventBus;
use crate::image_cache::ImageCache;
use crate::net::{HttpImageFetcher, ImageFetcher, RetryPolicy};
use crate::search_cache::SearchResultsCache;
use crate::settings::{DownloadSettings, DownloadSettingsUpdate, SettingsStore};
use crate::storage::{Database, KeyValueStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Optional replacements for the production collaborators
pub struct EngineBuilder {
    config: EngineConfig,
    fetcher: Option<Arc<dyn ImageFetcher>>,
    source: Option<Arc<dyn ChapterSource>>,
    clock: Arc<dyn Clock>,
    space_probe: Option<Arc<dyn SpaceProbe>>,
    retry: Option<RetryPolicy>,
}

impl EngineBuilder {
    pub fn fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Resolve pages through `source` instead of the registered page lists
    pub fn chapter_source(mut self, source: Arc<dyn ChapterSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space_probe = Some(probe);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let db = match &config.database_path {
            Some(path) => Database::new(path).await?,
            None => Database::new_in_memory().await?,
        };
        let kv = KeyValueStore::new(db);

        let fetcher: Arc<dyn ImageFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpImageFetcher::new(&config)?),
        };
        let retry = self.retry.unwrap_or_else(|| RetryPolicy::from_config(&config));
        let clock = self.clock;
        let events = EventBus::new();
        let settings = Arc::new(SettingsStore::new(kv.clone()));

        let mut store = ContentStore::new(&config, kv.clone(), Arc::clone(&settings), Arc::clone(&fetcher), events.clone())
            .with_clock(Arc::clone(&clock))
            .with_retry_policy(retry);
        if let Some(probe) = self.space_probe {
            store = store.with_space_probe(probe);
        }
        let store = Arc::new(store);

        let image_cache = ImageCache::with_parts(&config, kv.clone(), fetcher, retry, Arc::clone(&clock));
        let search_cache = Arc::new(SearchResultsCache::load(kv.clone(), Arc::clone(&clock)).await);
        let queue = Arc::new(DownloadQueue::load(kv.clone(), Arc::clone(&clock)).await?);

        let registered_pages = Arc::new(RegisteredPagesSource::new());
        let source: Arc<dyn ChapterSource> = match self.source {
            Some(source) => source,
            None => registered_pages.clone(),
        };
        let manager = Arc::new(
            DownloadManager::new(Arc::clone(&queue), Arc::clone(&store), source, Arc::clone(&settings), events.clone())
                .with_clock(Arc::clone(&clock)),
        );
        let batch = Arc::new(BatchDownloadOrchestrator::new(Arc::clone(&queue), Arc::clone(&store)));
        let status = Arc::new(DownloadStatusService::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&manager),
            config.status_cache_ttl(),
        ));

        tracing::debug!(
            downloads_root = %config.downloads_root.display(),
            cache_root = %config.cache_root.display(),
            "engine built"
        );

        Ok(Engine {
            config,
            kv,
            settings,
            events,
            store,
            image_cache,
            search_cache,
            queue,
            manager,
            batch,
            status,
            registered_pages,
            tasks: Mutex::default(),
            closed: AtomicBool::new(false),
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    kv: KeyValueStore,
    settings: Arc<SettingsStore>,
    events: EventBus,
    store: Arc<ContentStore>,
    image_cache: ImageCache,
    search_cache: Arc<SearchResultsCache>,
    queue: Arc<DownloadQueue>,
    manager: Arc<DownloadManager>,
    batch: Arc<BatchDownloadOrchestrator>,
    status: Arc<DownloadStatusService>,
    registered_pages: Arc<RegisteredPagesSource>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            fetcher: None,
            source: None,
            clock: Arc::new(SystemClock),
            space_probe: None,
            retry: None,
        }
    }

    /// Load persisted state and start the background tasks. Calling it again is a no-op.
    ///
    /// An engine that was shut down cannot be started again; build a new one.
    pub async fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShelfError::InvalidState("Engine has been shut down".to_string()));
        }
        if self.is_running() {
            return Ok(());
        }

        self.store.initialize().await?;
        self.image_cache.initialize().await?;

        // Receivers are taken before the loops start so no event is missed
        let batch_events = self.events.subscribe();
        let status_events = self.events.subscribe();

        let handles = vec![
            tokio::spawn(Arc::clone(&self.manager).run()),
            tokio::spawn(Arc::clone(&self.batch).run(batch_events)),
            tokio::spawn(Arc::clone(&self.status).run(status_events)),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(handles);

        let settings = self.settings.get().await;
        if settings.auto_cleanup_enabled {
            let report = self.store.cleanup_old_downloads().await?;
            if !report.is_empty() {
                tracing::info!(deleted = report.deleted.len(), freed = report.freed_bytes, "startup cleanup");
            }
        }
        if let Err(e) = self.image_cache.cleanup_expired().await {
            tracing::warn!(error = %e, "image cache cleanup failed");
        }

        tracing::info!("engine started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|handle| !handle.is_finished())
    }

    /// Stop the background tasks, write pending bookkeeping and close the database.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manager.shutdown();
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
        self.store.flush().await;
        self.image_cache.flush().await;
        self.kv.database().close().await;
        tracing::info!("engine stopped");
    }

    /// Merge a settings update and let the running components react to it
    pub async fn update_settings(&self, update: DownloadSettingsUpdate) -> Result<DownloadSettings> {
        let quota_changed = update.max_storage_size.is_some();
        let settings = self.settings.update(update).await?;
        self.manager.poke();
        if quota_changed {
            let report = self.store.check_storage_quota().await?;
            if !report.is_empty() {
                tracing::info!(deleted = report.deleted.len(), "quota lowered, chapters evicted");
            }
        }
        Ok(settings)
    }

    pub async fn reset_settings(&self) -> Result<DownloadSettings> {
        let settings = self.settings.reset().await?;
        self.manager.poke();
        Ok(settings)
    }

    /// Auto-cleanup, quota check and expired cache images in one pass
    pub async fn run_maintenance(&self) -> Result<CleanupReport> {
        let mut report = self.store.cleanup_old_downloads().await?;
        report.merge(self.store.check_storage_quota().await?);
        self.image_cache.cleanup_expired().await?;
        Ok(report)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn kv(&self) -> &KeyValueStore {
        &self.kv
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn image_cache(&self) -> &ImageCache {
        &self.image_cache
    }

    pub fn search_cache(&self) -> &SearchResultsCache {
        &self.search_cache
    }

    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }

    pub fn manager(&self) -> &Arc<DownloadManager> {
        &self.manager
    }

    pub fn batch(&self) -> &Arc<BatchDownloadOrchestrator> {
        &self.batch
    }

    pub fn status(&self) -> &Arc<DownloadStatusService> {
        &self.status
    }

    /// Page lists used when no custom chapter source was configured
    pub fn registered_pages(&self) -> &RegisteredPagesSource {
        &self.registered_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{FixedSpaceProbe, PageRequest};
    use crate::download::{BatchStatus, ChapterInfo, BatchOptions, ChapterStatus};
    use crate::net::fetcher::mock::MockFetcher;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn engine(temp_dir: &TempDir) -> Engine {
        Engine::builder(EngineConfig::with_root(temp_dir.path()))
            .fetcher(Arc::new(MockFetcher::new(64)))
            .space_probe(Arc::new(FixedSpaceProbe::new(None)))
            .retry_policy(RetryPolicy::immediate(2))
            .build()
            .await
            .unwrap()
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_batch_download_end_to_end() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir).await;
        engine.start().await.unwrap();
        assert!(engine.is_running());

        for ch in ["1", "2"] {
            engine
                .registered_pages()
                .register("m1", ch, vec![PageRequest::new(1, format!("https://cdn/{}/1.jpg", ch))])
                .await;
        }
        // No pages registered for chapter 3
        let chapters = vec![
            ChapterInfo::new("1", "https://site/m1/1"),
            ChapterInfo::new("2", "https://site/m1/2"),
            ChapterInfo::new("3", "https://site/m1/3"),
        ];
        engine
            .batch()
            .update_session_metadata("m1", "Manga One", chapters, BatchOptions::default())
            .await;
        engine.batch().start_batch_download("m1", None).await.unwrap();

        let batch = Arc::clone(engine.batch());
        wait_for(|| {
            let batch = Arc::clone(&batch);
            async move { batch.get_state("m1").await.status == BatchStatus::Completed }
        })
        .await;

        let state = engine.batch().get_state("m1").await;
        assert_eq!(state.completed_chapters, 2);
        assert_eq!(state.failed_chapters.len(), 1);
        assert_eq!(state.failed_chapters[0].chapter_number, "3");
        assert_eq!(state.progress, 100);

        let chapters: Vec<String> = ["1", "2", "3"].iter().map(|s| s.to_string()).collect();
        let report = engine.status().get_batch_download_status("m1", &chapters).await;
        assert_eq!(report.summary.downloaded, 2);
        assert_eq!(report.statuses[2].status, ChapterStatus::Failed);

        engine.shutdown().await;
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_settings_update_persists_across_restart() {
        let temp_dir = TempDir::new().unwrap();
        {
            let engine = engine(&temp_dir).await;
            engine
                .update_settings(DownloadSettingsUpdate {
                    max_concurrent_downloads: Some(1),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let engine = engine(&temp_dir).await;
        assert_eq!(engine.settings().get().await.max_concurrent_downloads, 1);
        let settings = engine.reset_settings().await.unwrap();
        assert_eq!(settings, DownloadSettings::default());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir).await;
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.tasks.lock().unwrap().len(), 3);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shut_down_engine_refuses_to_start() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir).await;
        engine.start().await.unwrap();
        engine.shutdown().await;
        engine.shutdown().await;

        assert!(engine.kv().database().is_closed());
        assert!(matches!(engine.start().await, Err(ShelfError::InvalidState(_))));
        assert!(!engine.is_running());
    }
}
