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


//! Download manager
//!
//! Pulls chapters off the [`DownloadQueue`] and runs up to
//! `max_concurrent_downloads` of them at once. Each chapter is resolved through
//! the [`ChapterSource`], streamed into the [`ContentStore`], and reported on
//! the [`EventBus`] as progress followed by exactly one completed or failed
//! event.
//!
//! # Scheduling
//! - The slot limit is re-read from settings on every pass; shrinking it never
//!   interrupts running transfers
//! - Items leave the queue only when they finish, so a restart resumes them
//! - Paused: running transfers finish, nothing new starts
//! - Chapters of one manga start in enqueue order; completion order across
//!   slots is not defined

use crate::clock::{Clock, SystemClock};
use crate::content::{ChapterKey, ChapterMetadata, ContentStore, SaveProgress};
use crate::download::progress::{ChapterProgress, DownloadState, ProgressTracker};
use crate::download::queue::{DownloadQueue, QueueItem};
use crate::download::source::ChapterSource;
use crate::error::{Result, ShelfError};
use crate::events::{DownloadEvent, EventBus};
use crate::settings::SettingsStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Most recent failure of a chapter, kept until it succeeds or is cleared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

type ActiveMap = Arc<RwLock<HashMap<ChapterKey, ChapterProgress>>>;

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct DownloadManager {
    queue: Arc<DownloadQueue>,
    store: Arc<ContentStore>,
    source: Arc<dyn ChapterSource>,
    settings: Arc<SettingsStore>,
    events: EventBus,
    clock: Arc<dyn Clock>,

    /// In-flight chapters and their latest progress
    active: ActiveMap,

    failures: RwLock<HashMap<ChapterKey, FailureRecord>>,

    slots: Arc<Semaphore>,
    slot_limit: AtomicUsize,

    paused: AtomicBool,
    shutdown: AtomicBool,
    wake: Notify,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("active", &read(&self.active).len())
            .field("slot_limit", &self.slot_limit.load(Ordering::SeqCst))
            .field("paused", &self.paused.load(Ordering::SeqCst))
            .finish()
    }
}

impl DownloadManager {
    pub fn new(
        queue: Arc<DownloadQueue>,
        store: Arc<ContentStore>,
        source: Arc<dyn ChapterSource>,
        settings: Arc<SettingsStore>,
        events: EventBus,
    ) -> Self {
        Self {
            queue,
            store,
            source,
            settings,
            events,
            clock: Arc::new(SystemClock),
            active: Arc::default(),
            failures: RwLock::default(),
            slots: Arc::new(Semaphore::new(0)),
            slot_limit: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Scheduling loop. Runs until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) {
        tracing::info!("download manager started");
        while !self.shutdown.load(Ordering::SeqCst) {
            if self.paused.load(Ordering::SeqCst) {
                self.wake.notified().await;
                continue;
            }

            self.sync_slots().await;

            let permit = match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // All slots busy; a finishing transfer wakes us
                    self.wake.notified().await;
                    continue;
                }
            };

            let excluding: HashSet<ChapterKey> = read(&self.active).keys().cloned().collect();
            match self.queue.next_pending(&excluding).await {
                Some(item) => self.spawn_item(item, permit),
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = self.queue.notified() => {}
                        _ = self.wake.notified() => {}
                    }
                }
            }
        }
        tracing::info!("download manager stopped");
    }

    /// Match the semaphore to the configured concurrency
    async fn sync_slots(&self) {
        let target = self.settings.get().await.max_concurrent_downloads.max(1);
        let current = self.slot_limit.swap(target, Ordering::SeqCst);

        if target > current {
            self.slots.add_permits(target - current);
        } else if target < current {
            // Retire permits as running transfers hand them back
            let slots = Arc::clone(&self.slots);
            let excess = (current - target) as u32;
            tokio::spawn(async move {
                if let Ok(permits) = slots.acquire_many_owned(excess).await {
                    permits.forget();
                }
            });
        }
    }

    fn spawn_item(self: &Arc<Self>, item: QueueItem, permit: OwnedSemaphorePermit) {
        let key = item.key();
        self.clear_failure(&item.manga_id, &item.chapter_number);
        {
            let mut progress = ChapterProgress::new(&item.manga_id, &item.chapter_number);
            progress.state = DownloadState::Downloading;
            write(&self.active).insert(key.clone(), progress);
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            tracing::info!(manga_id = %item.manga_id, chapter = %item.chapter_number, "download started");

            let result = manager.download_chapter(&item).await;

            // Dequeue before leaving the active set so the loop never restarts a finished item
            if let Err(e) = manager.queue.remove_from_queue(&item.manga_id, &item.chapter_number).await {
                tracing::warn!(manga_id = %item.manga_id, chapter = %item.chapter_number, error = %e, "failed to dequeue finished item");
            }

            let event = match result {
                Ok(metadata) => {
                    write(&manager.failures).remove(&key);
                    tracing::info!(
                        manga_id = %item.manga_id,
                        chapter = %item.chapter_number,
                        pages = metadata.total_images,
                        bytes = metadata.total_size,
                        "download completed"
                    );
                    DownloadEvent::Completed {
                        manga_id: item.manga_id.clone(),
                        chapter_number: item.chapter_number.clone(),
                        total_images: metadata.total_images,
                        total_size: metadata.total_size,
                    }
                }
                Err(e) => {
                    tracing::warn!(manga_id = %item.manga_id, chapter = %item.chapter_number, error = %e, "download failed");
                    write(&manager.failures).insert(
                        key.clone(),
                        FailureRecord {
                            error: e.to_string(),
                            failed_at: manager.clock.now(),
                        },
                    );
                    DownloadEvent::Failed {
                        manga_id: item.manga_id.clone(),
                        chapter_number: item.chapter_number.clone(),
                        error: e.user_message(),
                    }
                }
            };

            write(&manager.active).remove(&key);
            manager.events.publish(event);
            manager.wake.notify_one();
        });
    }

    async fn download_chapter(&self, item: &QueueItem) -> Result<ChapterMetadata> {
        let pages = self
            .source
            .resolve_pages(&item.manga_id, &item.chapter_number, &item.chapter_url)
            .await
            .map_err(|e| match e {
                e @ ShelfError::ChapterResolutionFailed { .. } => e,
                other => ShelfError::ChapterResolutionFailed {
                    manga_id: item.manga_id.clone(),
                    chapter_number: item.chapter_number.clone(),
                    message: other.to_string(),
                },
            })?;

        let key = item.key();
        let tracker = Mutex::new(ProgressTracker::new(&item.manga_id, &item.chapter_number));
        let publish = |progress: ChapterProgress| {
            if let Some(entry) = write(&self.active).get_mut(&key) {
                *entry = progress.clone();
            }
            self.events.publish(DownloadEvent::Progress {
                manga_id: item.manga_id.clone(),
                chapter_number: item.chapter_number.clone(),
                progress,
            });
        };

        let on_progress = |event: SaveProgress| {
            let snapshot = {
                let mut tracker = tracker.lock().unwrap_or_else(|p| p.into_inner());
                match event {
                    SaveProgress::Started { total_pages } => {
                        tracker.set_total_pages(total_pages);
                        Some(tracker.snapshot())
                    }
                    SaveProgress::Bytes(bytes) => tracker.add_bytes(bytes).then(|| tracker.snapshot()),
                    SaveProgress::PageDone { .. } => {
                        tracker.page_completed();
                        Some(tracker.snapshot())
                    }
                }
            };
            if let Some(progress) = snapshot {
                publish(progress);
            }
        };

        self.store
            .save_chapter_images_with_progress(&item.manga_id, &item.chapter_number, &pages, Some(&on_progress))
            .await
    }

    /// Stop starting new transfers; running ones finish
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("downloads paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("downloads resumed");
            self.wake.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Re-evaluate the queue and concurrency settings now
    pub fn poke(&self) {
        self.wake.notify_one();
    }

    /// Stop the scheduling loop after its current pass
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_active(&self, manga_id: &str, chapter_number: &str) -> bool {
        read(&self.active).contains_key(&ChapterKey::new(manga_id, chapter_number))
    }

    pub fn active_progress(&self, manga_id: &str, chapter_number: &str) -> Option<ChapterProgress> {
        read(&self.active)
            .get(&ChapterKey::new(manga_id, chapter_number))
            .cloned()
    }

    pub fn active_downloads(&self) -> Vec<ChapterProgress> {
        read(&self.active).values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        read(&self.active).len()
    }

    pub fn last_failure(&self, manga_id: &str, chapter_number: &str) -> Option<FailureRecord> {
        read(&self.failures)
            .get(&ChapterKey::new(manga_id, chapter_number))
            .cloned()
    }

    pub fn clear_failure(&self, manga_id: &str, chapter_number: &str) {
        write(&self.failures).remove(&ChapterKey::new(manga_id, chapter_number));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::content::PageRequest;
    use crate::download::source::RegisteredPagesSource;
    use crate::net::fetcher::mock::MockFetcher;
    use crate::net::RetryPolicy;
    use crate::settings::DownloadSettingsUpdate;
    use crate::storage::KeyValueStore;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    struct Fixture {
        _temp_dir: TempDir,
        manager: Arc<DownloadManager>,
        queue: Arc<DownloadQueue>,
        source: Arc<RegisteredPagesSource>,
        store: Arc<ContentStore>,
        settings: Arc<SettingsStore>,
        rx: broadcast::Receiver<DownloadEvent>,
    }

    async fn fixture(fetcher: MockFetcher) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig::with_root(temp_dir.path());
        let kv = KeyValueStore::in_memory().await.unwrap();
        let events = EventBus::new();
        let rx = events.subscribe();
        let settings = Arc::new(SettingsStore::new(kv.clone()));
        let store = Arc::new(
            ContentStore::new(&config, kv.clone(), Arc::clone(&settings), Arc::new(fetcher), events.clone())
                .with_space_probe(Arc::new(crate::content::FixedSpaceProbe::new(None)))
                .with_retry_policy(RetryPolicy::immediate(2)),
        );
        let queue = Arc::new(DownloadQueue::load(kv, Arc::new(SystemClock)).await.unwrap());
        let source = Arc::new(RegisteredPagesSource::new());
        let manager = Arc::new(DownloadManager::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            source.clone(),
            Arc::clone(&settings),
            events,
        ));

        Fixture {
            _temp_dir: temp_dir,
            manager,
            queue,
            source,
            store,
            settings,
            rx,
        }
    }

    async fn register(source: &RegisteredPagesSource, manga: &str, chapter: &str, pages: u32) {
        let requests = (1..=pages)
            .map(|n| PageRequest::new(n, format!("https://cdn.example.com/{}/{}/{}.jpg", manga, chapter, n)))
            .collect();
        source.register(manga, chapter, requests).await;
    }

    /// Next completed/failed event, skipping progress
    async fn next_outcome(rx: &mut broadcast::Receiver<DownloadEvent>) -> DownloadEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .unwrap();
            if matches!(event, DownloadEvent::Completed { .. } | DownloadEvent::Failed { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_downloads_queued_chapter() {
        let mut f = fixture(MockFetcher::new(50)).await;
        register(&f.source, "m1", "1", 3).await;
        f.queue.add_to_queue("m1", "1", "https://site/m1/1").await.unwrap();

        tokio::spawn(Arc::clone(&f.manager).run());

        let mut saw_progress = false;
        let outcome = loop {
            let event = f.rx.recv().await.unwrap();
            match event {
                DownloadEvent::Progress { ref progress, .. } => {
                    saw_progress = true;
                    assert!(progress.percent_complete <= 100.0);
                }
                other => break other,
            }
        };
        assert!(saw_progress);
        assert_eq!(
            outcome,
            DownloadEvent::Completed {
                manga_id: "m1".to_string(),
                chapter_number: "1".to_string(),
                total_images: 3,
                total_size: 150,
            }
        );
        assert!(f.store.is_chapter_downloaded("m1", "1").await.unwrap());
        assert!(f.queue.is_empty().await);
        assert!(!f.manager.is_active("m1", "1"));
        f.manager.shutdown();
    }

    #[tokio::test]
    async fn test_unresolvable_chapter_fails_and_leaves_queue() {
        let mut f = fixture(MockFetcher::new(10)).await;
        f.queue.add_to_queue("m1", "9", "https://site/m1/9").await.unwrap();
        tokio::spawn(Arc::clone(&f.manager).run());

        let event = next_outcome(&mut f.rx).await;
        assert!(matches!(event, DownloadEvent::Failed { ref chapter_number, .. } if chapter_number == "9"));
        assert!(f.manager.last_failure("m1", "9").is_some());
        assert!(!f.queue.contains("m1", "9").await);
        f.manager.shutdown();
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let mut f = fixture(MockFetcher::new(10).with_delay(Duration::from_millis(100))).await;
        f.settings
            .update(DownloadSettingsUpdate {
                max_concurrent_downloads: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        for ch in ["1", "2", "3", "4"] {
            register(&f.source, "m1", ch, 1).await;
            f.queue.add_to_queue("m1", ch, "u").await.unwrap();
        }

        let manager = Arc::clone(&f.manager);
        tokio::spawn(Arc::clone(&f.manager).run());

        let watcher = tokio::spawn(async move {
            let mut peak = 0;
            for _ in 0..60 {
                peak = peak.max(manager.active_count());
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            peak
        });

        for _ in 0..4 {
            assert!(matches!(next_outcome(&mut f.rx).await, DownloadEvent::Completed { .. }));
        }
        let peak = watcher.await.unwrap();
        assert!(peak <= 2, "peak concurrency {}", peak);
        assert!(peak >= 1);
        f.manager.shutdown();
    }

    #[tokio::test]
    async fn test_paused_manager_starts_nothing() {
        let mut f = fixture(MockFetcher::new(10)).await;
        register(&f.source, "m1", "1", 1).await;
        f.manager.pause();
        f.queue.add_to_queue("m1", "1", "u").await.unwrap();
        tokio::spawn(Arc::clone(&f.manager).run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.queue.contains("m1", "1").await);
        assert!(!f.store.is_chapter_downloaded("m1", "1").await.unwrap());

        f.manager.resume();
        assert!(matches!(next_outcome(&mut f.rx).await, DownloadEvent::Completed { .. }));
        f.manager.shutdown();
    }
}
