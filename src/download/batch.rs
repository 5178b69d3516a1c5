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


//! Batch downloads
//!
//! A batch is every selected chapter of one manga, tracked as one session:
//!
//! ```text
//! idle -> downloading -> completed
//!              |
//!              +-------> cancelled
//! ```
//!
//! Failed chapters are recorded inside the session; a batch whose chapters
//! were all attempted is `completed` even when some failed. Sessions live in
//! memory only. After a restart every manga starts `idle` again, while the
//! persisted queue keeps downloading whatever was still pending.
//!
//! State changes are driven by [`DownloadEvent`]s read from a broadcast
//! receiver in [`run`](BatchDownloadOrchestrator::run). Events for mangas
//! without a downloading session are dropped, not buffered.

use crate::content::ContentStore;
use crate::download::queue::DownloadQueue;
use crate::error::{Result, ShelfError};
use crate::events::DownloadEvent;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    #[default]
    Idle,
    Downloading,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedChapter {
    pub chapter_number: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchDownloadState {
    pub status: BatchStatus,
    pub total_chapters: usize,
    pub processed_chapters: usize,
    pub completed_chapters: usize,
    pub failed_chapters: Vec<FailedChapter>,
    pub current_chapter: Option<String>,
    /// 0 - 100
    pub progress: u8,
    pub message: Option<String>,
}

impl BatchDownloadState {
    fn recompute_progress(&mut self) {
        self.progress = if self.total_chapters == 0 {
            100
        } else {
            ((self.processed_chapters * 100) / self.total_chapters).min(100) as u8
        };
    }
}

/// A chapter the session may download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterInfo {
    pub chapter_number: String,
    pub chapter_url: String,
}

impl ChapterInfo {
    pub fn new(chapter_number: impl Into<String>, chapter_url: impl Into<String>) -> Self {
        Self {
            chapter_number: chapter_number.into(),
            chapter_url: chapter_url.into(),
        }
    }
}

/// Presentation data kept with a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    pub cover_url: Option<String>,
}

/// Session data as seen by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub manga_id: String,
    pub title: String,
    pub chapters: Vec<ChapterInfo>,
    pub options: BatchOptions,
    pub state: BatchDownloadState,
}

#[derive(Debug, Default)]
struct Session {
    title: String,
    chapters: Vec<ChapterInfo>,
    options: BatchOptions,
    state: BatchDownloadState,
    /// Chapters of the current run still waiting for an outcome
    outstanding: HashSet<String>,
}

impl Session {
    fn url_of(&self, chapter_number: &str) -> Option<&str> {
        self.chapters
            .iter()
            .find(|c| c.chapter_number == chapter_number)
            .map(|c| c.chapter_url.as_str())
    }
}

pub type StateListener = Arc<dyn Fn(&BatchDownloadState) + Send + Sync>;

type ListenerRegistry = Mutex<HashMap<String, Vec<(u64, StateListener)>>>;

/// Handle returned by [`BatchDownloadOrchestrator::subscribe_state`]
#[derive(Debug)]
pub struct StateSubscription {
    id: u64,
    manga_id: String,
    registry: Weak<ListenerRegistry>,
}

impl StateSubscription {
    /// Stop receiving updates. Calling twice is harmless.
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut listeners = registry.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(list) = listeners.get_mut(&self.manga_id) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                listeners.remove(&self.manga_id);
            }
        }
    }
}

pub struct BatchDownloadOrchestrator {
    queue: Arc<DownloadQueue>,
    store: Arc<ContentStore>,
    sessions: RwLock<HashMap<String, Session>>,
    listeners: Arc<ListenerRegistry>,
    next_listener_id: AtomicU64,
}

impl std::fmt::Debug for BatchDownloadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDownloadOrchestrator").finish_non_exhaustive()
    }
}

impl BatchDownloadOrchestrator {
    pub fn new(queue: Arc<DownloadQueue>, store: Arc<ContentStore>) -> Self {
        Self {
            queue,
            store,
            sessions: RwLock::default(),
            listeners: Arc::default(),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Register or refresh a manga's chapter set without starting anything
    pub async fn update_session_metadata(
        &self,
        manga_id: &str,
        title: &str,
        chapters: Vec<ChapterInfo>,
        options: BatchOptions,
    ) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(manga_id.to_string()).or_default();
        session.title = title.to_string();
        session.chapters = chapters;
        session.options = options;
        tracing::debug!(manga_id, chapters = session.chapters.len(), "session metadata updated");
    }

    /// Queue the selected chapters (all known chapters when `None`) that are not downloaded yet
    pub async fn start_batch_download(
        &self,
        manga_id: &str,
        selected: Option<Vec<String>>,
    ) -> Result<BatchDownloadState> {
        let targets: Vec<ChapterInfo> = {
            let sessions = self.sessions.read().await;
            let session = sessions.get(manga_id).ok_or_else(|| {
                ShelfError::InvalidState(format!("No session registered for manga {}", manga_id))
            })?;
            if session.state.status == BatchStatus::Downloading {
                return Err(ShelfError::InvalidState(format!(
                    "Batch download already running for manga {}",
                    manga_id
                )));
            }
            match &selected {
                Some(numbers) => session
                    .chapters
                    .iter()
                    .filter(|c| numbers.contains(&c.chapter_number))
                    .cloned()
                    .collect(),
                None => session.chapters.clone(),
            }
        };

        let mut pending = Vec::with_capacity(targets.len());
        for chapter in &targets {
            let downloaded = self
                .store
                .is_chapter_downloaded(manga_id, &chapter.chapter_number)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(manga_id, chapter = %chapter.chapter_number, error = %e, "download check failed");
                    false
                });
            if !downloaded {
                pending.push(chapter.clone());
            }
        }

        let state = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.entry(manga_id.to_string()).or_default();
            session.outstanding.clear();

            if targets.is_empty() {
                session.state = BatchDownloadState {
                    status: BatchStatus::Completed,
                    progress: 100,
                    message: Some("No chapters selected for download".to_string()),
                    ..Default::default()
                };
            } else if pending.is_empty() {
                session.state = BatchDownloadState {
                    status: BatchStatus::Completed,
                    total_chapters: targets.len(),
                    processed_chapters: targets.len(),
                    completed_chapters: targets.len(),
                    progress: 100,
                    message: Some(format!("All {} chapters are already downloaded", targets.len())),
                    ..Default::default()
                };
            } else {
                session.state = BatchDownloadState {
                    status: BatchStatus::Downloading,
                    total_chapters: pending.len(),
                    current_chapter: pending.first().map(|c| c.chapter_number.clone()),
                    message: Some(format!("Downloading {} chapters", pending.len())),
                    ..Default::default()
                };

                // Enqueue under the lock so no outcome can slip in before the session is counting
                for chapter in &pending {
                    session.outstanding.insert(chapter.chapter_number.clone());
                    if let Err(e) = self
                        .queue
                        .add_to_queue(manga_id, &chapter.chapter_number, &chapter.chapter_url)
                        .await
                    {
                        tracing::warn!(manga_id, chapter = %chapter.chapter_number, error = %e, "could not queue chapter");
                        Self::record_failure(&mut session.state, &chapter.chapter_number, e.to_string());
                        session.outstanding.remove(&chapter.chapter_number);
                    }
                }
                Self::finish_if_done(&mut session.state);
            }
            session.state.clone()
        };

        tracing::info!(manga_id, status = ?state.status, total = state.total_chapters, "batch download started");
        self.notify(manga_id, &state);
        Ok(state)
    }

    fn record_failure(state: &mut BatchDownloadState, chapter_number: &str, error: String) {
        state.failed_chapters.push(FailedChapter {
            chapter_number: chapter_number.to_string(),
            error,
        });
        state.processed_chapters += 1;
    }

    fn finish_if_done(state: &mut BatchDownloadState) {
        state.recompute_progress();
        if state.status == BatchStatus::Downloading && state.processed_chapters >= state.total_chapters {
            state.status = BatchStatus::Completed;
            state.progress = 100;
            state.current_chapter = None;
            state.message = Some(if state.failed_chapters.is_empty() {
                format!("Downloaded {} chapters", state.completed_chapters)
            } else {
                format!(
                    "Downloaded {} chapters, {} failed",
                    state.completed_chapters,
                    state.failed_chapters.len()
                )
            });
        }
    }

    /// Apply one download event to its manga's session
    pub async fn handle_download_event(&self, event: &DownloadEvent) {
        let manga_id = event.manga_id();
        let chapter_number = event.chapter_number();

        let state = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(manga_id) else {
                return;
            };
            if session.state.status != BatchStatus::Downloading {
                return;
            }

            match event {
                DownloadEvent::Completed { .. } => {
                    if !session.outstanding.remove(chapter_number) {
                        return;
                    }
                    session.state.completed_chapters += 1;
                    session.state.processed_chapters += 1;
                }
                DownloadEvent::Failed { error, .. } => {
                    if !session.outstanding.remove(chapter_number) {
                        return;
                    }
                    Self::record_failure(&mut session.state, chapter_number, error.clone());
                }
                DownloadEvent::Progress { .. } => {
                    if !session.outstanding.contains(chapter_number)
                        || session.state.current_chapter.as_deref() == Some(chapter_number)
                    {
                        return;
                    }
                    session.state.current_chapter = Some(chapter_number.to_string());
                }
                DownloadEvent::Deleted { .. } => return,
            }

            Self::finish_if_done(&mut session.state);
            session.state.clone()
        };

        if state.status == BatchStatus::Completed {
            tracing::info!(
                manga_id,
                completed = state.completed_chapters,
                failed = state.failed_chapters.len(),
                "batch download finished"
            );
        }
        self.notify(manga_id, &state);
    }

    /// Stop the batch. Chapters not yet started are removed from the queue;
    /// a transfer already running finishes and its outcome is ignored.
    pub async fn cancel_batch_download(&self, manga_id: &str) -> Result<usize> {
        let state = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(manga_id) else {
                return Ok(0);
            };
            if session.state.status != BatchStatus::Downloading {
                return Ok(0);
            }
            session.state.status = BatchStatus::Cancelled;
            session.state.current_chapter = None;
            session.state.message = Some("Download cancelled".to_string());
            session.outstanding.clear();
            session.state.clone()
        };
        self.notify(manga_id, &state);

        let removed = self.queue.remove_manga(manga_id).await?;
        tracing::info!(manga_id, removed = removed.len(), "batch download cancelled");
        Ok(removed.len())
    }

    /// Queue the chapters recorded as failed again. Returns how many were queued.
    pub async fn retry_failed_chapters(&self, manga_id: &str) -> Result<usize> {
        let (state, queued) = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(manga_id) else {
                return Ok(0);
            };
            if session.state.failed_chapters.is_empty() {
                return Ok(0);
            }

            let failed = std::mem::take(&mut session.state.failed_chapters);
            let mut queued = 0;
            let mut still_failed = Vec::new();
            for chapter in failed {
                let Some(url) = session.url_of(&chapter.chapter_number).map(str::to_string) else {
                    still_failed.push(chapter);
                    continue;
                };
                match self.queue.add_to_queue(manga_id, &chapter.chapter_number, &url).await {
                    Ok(_) => {
                        session.outstanding.insert(chapter.chapter_number.clone());
                        queued += 1;
                    }
                    Err(e) => {
                        tracing::warn!(manga_id, chapter = %chapter.chapter_number, error = %e, "could not requeue chapter");
                        still_failed.push(chapter);
                    }
                }
            }

            session.state.failed_chapters = still_failed;
            if queued > 0 {
                // The new run covers what finished plus what is still pending.
                // Chapters a cancel dropped from the queue are not part of it.
                let state = &mut session.state;
                state.processed_chapters = state.completed_chapters + state.failed_chapters.len();
                state.total_chapters = state.processed_chapters + session.outstanding.len();
                state.status = BatchStatus::Downloading;
                state.message = Some(format!("Retrying {} chapters", queued));
                state.recompute_progress();
            }
            (session.state.clone(), queued)
        };

        tracing::info!(manga_id, queued, "retrying failed chapters");
        self.notify(manga_id, &state);
        Ok(queued)
    }

    /// Settle outstanding chapters whose outcome events were missed.
    ///
    /// A chapter that left the queue completed when the store has it and
    /// failed otherwise. Chapters still queued are left alone.
    pub async fn reconcile_outstanding(&self) {
        let snapshot: Vec<(String, Vec<String>)> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.state.status == BatchStatus::Downloading && !s.outstanding.is_empty())
            .map(|(manga_id, s)| (manga_id.clone(), s.outstanding.iter().cloned().collect()))
            .collect();

        for (manga_id, chapters) in snapshot {
            for chapter_number in chapters {
                // The manager dequeues only after the save finished, so check the queue first
                if self.queue.contains(&manga_id, &chapter_number).await {
                    continue;
                }
                let metadata = self
                    .store
                    .get_chapter_metadata(&manga_id, &chapter_number)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!(manga_id = %manga_id, chapter = %chapter_number, error = %e, "download check failed");
                        None
                    });
                let event = match metadata {
                    Some(metadata) => DownloadEvent::Completed {
                        manga_id: manga_id.clone(),
                        chapter_number: chapter_number.clone(),
                        total_images: metadata.total_images,
                        total_size: metadata.total_size,
                    },
                    None => DownloadEvent::Failed {
                        manga_id: manga_id.clone(),
                        chapter_number: chapter_number.clone(),
                        error: "Download outcome was lost".to_string(),
                    },
                };
                tracing::debug!(manga_id = %manga_id, chapter = %chapter_number, "reconciled missed outcome");
                self.handle_download_event(&event).await;
            }
        }
    }

    pub async fn get_state(&self, manga_id: &str) -> BatchDownloadState {
        self.sessions
            .read()
            .await
            .get(manga_id)
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }

    pub async fn get_session(&self, manga_id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(manga_id).map(|s| SessionInfo {
            manga_id: manga_id.to_string(),
            title: s.title.clone(),
            chapters: s.chapters.clone(),
            options: s.options.clone(),
            state: s.state.clone(),
        })
    }

    /// Call `listener` now with the current state and after every change
    pub async fn subscribe_state<F>(&self, manga_id: &str, listener: F) -> StateSubscription
    where
        F: Fn(&BatchDownloadState) + Send + Sync + 'static,
    {
        let listener: StateListener = Arc::new(listener);
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);

        // Registered under the sessions lock so no change falls between the first call and registration
        let sessions = self.sessions.read().await;
        let current = sessions.get(manga_id).map(|s| s.state.clone()).unwrap_or_default();
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(manga_id.to_string())
            .or_default()
            .push((id, Arc::clone(&listener)));
        drop(sessions);

        listener(&current);

        StateSubscription {
            id,
            manga_id: manga_id.to_string(),
            registry: Arc::downgrade(&self.listeners),
        }
    }

    fn notify(&self, manga_id: &str, state: &BatchDownloadState) {
        let listeners: Vec<StateListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(manga_id)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(state);
        }
    }

    /// Consume events until the channel closes
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<DownloadEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_download_event(&event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "batch orchestrator fell behind on download events");
                    self.reconcile_outstanding().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::EngineConfig;
    use crate::content::PageRequest;
    use crate::events::EventBus;
    use crate::net::fetcher::mock::MockFetcher;
    use crate::settings::SettingsStore;
    use crate::storage::KeyValueStore;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        orchestrator: BatchDownloadOrchestrator,
        queue: Arc<DownloadQueue>,
        store: Arc<ContentStore>,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig::with_root(temp_dir.path());
        let kv = KeyValueStore::in_memory().await.unwrap();
        let store = Arc::new(
            ContentStore::new(
                &config,
                kv.clone(),
                Arc::new(SettingsStore::new(kv.clone())),
                Arc::new(MockFetcher::new(10)),
                EventBus::new(),
            )
            .with_space_probe(Arc::new(crate::content::FixedSpaceProbe::new(None))),
        );
        let queue = Arc::new(DownloadQueue::load(kv, Arc::new(SystemClock)).await.unwrap());
        let orchestrator = BatchDownloadOrchestrator::new(Arc::clone(&queue), Arc::clone(&store));
        Fixture {
            _temp_dir: temp_dir,
            orchestrator,
            queue,
            store,
        }
    }

    fn chapters(numbers: &[&str]) -> Vec<ChapterInfo> {
        numbers
            .iter()
            .map(|n| ChapterInfo::new(*n, format!("https://site/x/{}", n)))
            .collect()
    }

    fn completed(manga: &str, chapter: &str) -> DownloadEvent {
        DownloadEvent::Completed {
            manga_id: manga.to_string(),
            chapter_number: chapter.to_string(),
            total_images: 1,
            total_size: 10,
        }
    }

    fn failed(manga: &str, chapter: &str) -> DownloadEvent {
        DownloadEvent::Failed {
            manga_id: manga.to_string(),
            chapter_number: chapter.to_string(),
            error: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_selection_completes_immediately() {
        let f = fixture().await;
        f.orchestrator
            .update_session_metadata("X", "Title", vec![], BatchOptions::default())
            .await;
        let state = f.orchestrator.start_batch_download("X", None).await.unwrap();
        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.progress, 100);
        assert_eq!(state.message.as_deref(), Some("No chapters selected for download"));
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_all_downloaded_completes_without_queueing() {
        let f = fixture().await;
        for ch in ["1", "2"] {
            f.store
                .save_chapter_images("X", ch, &[PageRequest::new(1, "https://cdn/p.jpg")])
                .await
                .unwrap();
        }
        f.orchestrator
            .update_session_metadata("X", "Title", chapters(&["1", "2"]), BatchOptions::default())
            .await;

        let state = f.orchestrator.start_batch_download("X", None).await.unwrap();
        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.progress, 100);
        assert_eq!(state.message.as_deref(), Some("All 2 chapters are already downloaded"));
        assert_eq!(f.queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_two_complete_one_fails() {
        let f = fixture().await;
        f.orchestrator
            .update_session_metadata("X", "Title", chapters(&["1", "2", "3"]), BatchOptions::default())
            .await;
        let state = f.orchestrator.start_batch_download("X", None).await.unwrap();
        assert_eq!(state.status, BatchStatus::Downloading);
        assert_eq!(f.queue.len().await, 3);

        f.orchestrator.handle_download_event(&completed("X", "1")).await;
        f.orchestrator.handle_download_event(&failed("X", "2")).await;
        assert_eq!(f.orchestrator.get_state("X").await.progress, 66);
        f.orchestrator.handle_download_event(&completed("X", "3")).await;

        let state = f.orchestrator.get_state("X").await;
        assert_eq!(state.completed_chapters, 2);
        assert_eq!(state.failed_chapters.len(), 1);
        assert_eq!(state.processed_chapters, 3);
        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.progress, 100);
    }

    #[tokio::test]
    async fn test_unknown_manga_event_is_ignored() {
        let f = fixture().await;
        f.orchestrator
            .update_session_metadata("X", "Title", chapters(&["1"]), BatchOptions::default())
            .await;
        let before = f.orchestrator.get_state("X").await;

        f.orchestrator.handle_download_event(&completed("nobody", "1")).await;
        f.orchestrator.handle_download_event(&failed("nobody", "1")).await;

        assert_eq!(f.orchestrator.get_state("X").await, before);
        assert_eq!(f.orchestrator.get_state("nobody").await, BatchDownloadState::default());
        assert!(f.orchestrator.get_session("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_outcomes_count_once() {
        let f = fixture().await;
        f.orchestrator
            .update_session_metadata("X", "Title", chapters(&["1", "2"]), BatchOptions::default())
            .await;
        f.orchestrator.start_batch_download("X", None).await.unwrap();

        f.orchestrator.handle_download_event(&completed("X", "1")).await;
        f.orchestrator.handle_download_event(&completed("X", "1")).await;
        let state = f.orchestrator.get_state("X").await;
        assert_eq!(state.processed_chapters, 1);
        assert_eq!(state.status, BatchStatus::Downloading);
    }

    #[tokio::test]
    async fn test_retry_requeues_only_failed() {
        let f = fixture().await;
        f.orchestrator
            .update_session_metadata("X", "Title", chapters(&["1", "2"]), BatchOptions::default())
            .await;
        f.orchestrator.start_batch_download("X", None).await.unwrap();
        // The manager dequeues finished items
        f.queue.remove_manga("X").await.unwrap();

        f.orchestrator.handle_download_event(&completed("X", "1")).await;
        f.orchestrator.handle_download_event(&failed("X", "2")).await;
        assert_eq!(f.orchestrator.get_state("X").await.status, BatchStatus::Completed);

        let queued = f.orchestrator.retry_failed_chapters("X").await.unwrap();
        assert_eq!(queued, 1);
        let items = f.queue.get_queued_items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].chapter_number, "2");
        assert_eq!(items[0].chapter_url, "https://site/x/2");

        let state = f.orchestrator.get_state("X").await;
        assert_eq!(state.status, BatchStatus::Downloading);
        assert_eq!(state.completed_chapters, 1);
        assert!(state.failed_chapters.is_empty());

        f.orchestrator.handle_download_event(&completed("X", "2")).await;
        let state = f.orchestrator.get_state("X").await;
        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.completed_chapters, 2);

        // Nothing left to retry
        assert_eq!(f.orchestrator.retry_failed_chapters("X").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_removes_queued_and_ignores_late_events() {
        let f = fixture().await;
        f.orchestrator
            .update_session_metadata("X", "Title", chapters(&["1", "2", "3"]), BatchOptions::default())
            .await;
        f.queue.add_to_queue("Y", "1", "u").await.unwrap();
        f.orchestrator.start_batch_download("X", None).await.unwrap();

        let removed = f.orchestrator.cancel_batch_download("X").await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(f.queue.len().await, 1);

        f.orchestrator.handle_download_event(&completed("X", "1")).await;
        let state = f.orchestrator.get_state("X").await;
        assert_eq!(state.status, BatchStatus::Cancelled);
        assert_eq!(state.completed_chapters, 0);
    }

    #[tokio::test]
    async fn test_retry_after_cancel_finishes_and_allows_restart() {
        let f = fixture().await;
        f.orchestrator
            .update_session_metadata("X", "Title", chapters(&["1", "2", "3"]), BatchOptions::default())
            .await;
        f.orchestrator.start_batch_download("X", None).await.unwrap();
        f.queue.remove_from_queue("X", "1").await.unwrap();
        f.orchestrator.handle_download_event(&failed("X", "1")).await;
        f.orchestrator.cancel_batch_download("X").await.unwrap();

        assert_eq!(f.orchestrator.retry_failed_chapters("X").await.unwrap(), 1);
        let state = f.orchestrator.get_state("X").await;
        assert_eq!(state.status, BatchStatus::Downloading);
        assert_eq!(state.total_chapters, 1);
        assert_eq!(state.processed_chapters, 0);

        f.queue.remove_from_queue("X", "1").await.unwrap();
        f.orchestrator.handle_download_event(&completed("X", "1")).await;
        let state = f.orchestrator.get_state("X").await;
        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.completed_chapters, 1);
        assert_eq!(state.progress, 100);

        let restarted = f.orchestrator.start_batch_download("X", None).await.unwrap();
        assert_eq!(restarted.status, BatchStatus::Downloading);
        assert_eq!(restarted.total_chapters, 3);
    }

    #[tokio::test]
    async fn test_retry_mid_run_keeps_pending_chapters() {
        let f = fixture().await;
        f.orchestrator
            .update_session_metadata("X", "Title", chapters(&["1", "2", "3"]), BatchOptions::default())
            .await;
        f.orchestrator.start_batch_download("X", None).await.unwrap();
        f.queue.remove_from_queue("X", "1").await.unwrap();
        f.orchestrator.handle_download_event(&failed("X", "1")).await;

        assert_eq!(f.orchestrator.retry_failed_chapters("X").await.unwrap(), 1);
        let state = f.orchestrator.get_state("X").await;
        assert_eq!(state.total_chapters, 3);
        assert_eq!(state.processed_chapters, 0);

        for ch in ["1", "2", "3"] {
            f.orchestrator.handle_download_event(&completed("X", ch)).await;
        }
        let state = f.orchestrator.get_state("X").await;
        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.completed_chapters, 3);
    }

    #[tokio::test]
    async fn test_reconcile_settles_missed_outcomes() {
        let f = fixture().await;
        f.orchestrator
            .update_session_metadata("X", "Title", chapters(&["1", "2", "3"]), BatchOptions::default())
            .await;
        f.orchestrator.start_batch_download("X", None).await.unwrap();

        // "1" finished on disk, "2" left the queue without a download, "3" is still pending
        f.store
            .save_chapter_images("X", "1", &[PageRequest::new(1, "https://cdn/p.jpg")])
            .await
            .unwrap();
        f.queue.remove_from_queue("X", "1").await.unwrap();
        f.queue.remove_from_queue("X", "2").await.unwrap();

        f.orchestrator.reconcile_outstanding().await;
        let state = f.orchestrator.get_state("X").await;
        assert_eq!(state.status, BatchStatus::Downloading);
        assert_eq!(state.completed_chapters, 1);
        assert_eq!(state.failed_chapters.len(), 1);
        assert_eq!(state.failed_chapters[0].chapter_number, "2");
        assert_eq!(state.processed_chapters, 2);

        f.queue.remove_from_queue("X", "3").await.unwrap();
        f.orchestrator.reconcile_outstanding().await;
        assert_eq!(f.orchestrator.get_state("X").await.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_subscribe_fires_immediately_and_on_change() {
        let f = fixture().await;
        let seen: Arc<Mutex<Vec<BatchStatus>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let subscription = f
            .orchestrator
            .subscribe_state("X", move |state| sink.lock().unwrap().push(state.status))
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![BatchStatus::Idle]);

        f.orchestrator
            .update_session_metadata("X", "Title", chapters(&["1"]), BatchOptions::default())
            .await;
        f.orchestrator.start_batch_download("X", None).await.unwrap();
        f.orchestrator.handle_download_event(&completed("X", "1")).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![BatchStatus::Idle, BatchStatus::Downloading, BatchStatus::Completed]
        );

        subscription.unsubscribe();
        subscription.unsubscribe();
        f.orchestrator.start_batch_download("X", None).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_start_requires_session() {
        let f = fixture().await;
        assert!(matches!(
            f.orchestrator.start_batch_download("nobody", None).await,
            Err(ShelfError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_selection_filters_chapters() {
        let f = fixture().await;
        f.orchestrator
            .update_session_metadata("X", "Title", chapters(&["1", "2", "3"]), BatchOptions::default())
            .await;
        let state = f
            .orchestrator
            .start_batch_download("X", Some(vec!["2".to_string()]))
            .await
            .unwrap();
        assert_eq!(state.total_chapters, 1);
        assert_eq!(f.queue.get_queued_items().await[0].chapter_number, "2");
    }
}
