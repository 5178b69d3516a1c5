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


//! Consolidated chapter download status
//!
//! A chapter's status comes from three places: the content store (is it on
//! disk), the queue (is it waiting) and the manager (is it transferring, did it
//! fail). Answers are cached for a short TTL since UIs poll the same chapters
//! repeatedly. [`run`](DownloadStatusService::run) drops cached entries as soon
//! as a download event touches their chapter.

use crate::content::{ChapterKey, ContentStore};
use crate::download::manager::DownloadManager;
use crate::download::progress::ChapterProgress;
use crate::download::queue::DownloadQueue;
use crate::events::DownloadEvent;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChapterStatus {
    Downloaded,
    Downloading,
    Queued,
    Failed,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterDownloadStatus {
    pub manga_id: String,
    pub chapter_number: String,
    pub status: ChapterStatus,

    /// Set while the chapter is transferring
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ChapterProgress>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_images: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
}

impl ChapterDownloadStatus {
    fn new(manga_id: &str, chapter_number: &str, status: ChapterStatus) -> Self {
        Self {
            manga_id: manga_id.to_string(),
            chapter_number: chapter_number.to_string(),
            status,
            progress: None,
            error: None,
            total_images: None,
            total_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub downloaded: usize,
    pub downloading: usize,
    pub queued: usize,
    pub failed: usize,
    pub paused: usize,
}

impl StatusSummary {
    fn count(&mut self, status: ChapterStatus) {
        match status {
            ChapterStatus::Downloaded => self.downloaded += 1,
            ChapterStatus::Downloading => self.downloading += 1,
            ChapterStatus::Queued => self.queued += 1,
            ChapterStatus::Failed => self.failed += 1,
            ChapterStatus::Paused => self.paused += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatusReport {
    /// In request order
    pub statuses: Vec<ChapterDownloadStatus>,
    pub summary: StatusSummary,
}

pub struct DownloadStatusService {
    store: Arc<ContentStore>,
    queue: Arc<DownloadQueue>,
    manager: Arc<DownloadManager>,
    ttl: Duration,
    cache: Mutex<HashMap<ChapterKey, (Instant, ChapterDownloadStatus)>>,
}

impl std::fmt::Debug for DownloadStatusService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStatusService")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl DownloadStatusService {
    pub fn new(
        store: Arc<ContentStore>,
        queue: Arc<DownloadQueue>,
        manager: Arc<DownloadManager>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            manager,
            ttl,
            cache: Mutex::default(),
        }
    }

    fn cached(&self, key: &ChapterKey) -> Option<ChapterDownloadStatus> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, status)| status.clone())
    }

    pub async fn get_chapter_download_status(&self, manga_id: &str, chapter_number: &str) -> ChapterDownloadStatus {
        let key = ChapterKey::new(manga_id, chapter_number);
        if let Some(status) = self.cached(&key) {
            return status;
        }

        let status = match self.resolve(manga_id, chapter_number).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(manga_id, chapter = chapter_number, error = %e, "status lookup failed");
                let mut status = ChapterDownloadStatus::new(manga_id, chapter_number, ChapterStatus::Failed);
                status.error = Some(e.user_message());
                status
            }
        };

        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.retain(|_, (at, _)| at.elapsed() < self.ttl);
        cache.insert(key, (Instant::now(), status.clone()));
        status
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    async fn resolve(&self, manga_id: &str, chapter_number: &str) -> crate::error::Result<ChapterDownloadStatus> {
        if self.store.is_chapter_downloaded(manga_id, chapter_number).await? {
            let mut status = ChapterDownloadStatus::new(manga_id, chapter_number, ChapterStatus::Downloaded);
            if let Some(metadata) = self.store.get_chapter_metadata(manga_id, chapter_number).await? {
                status.total_images = Some(metadata.total_images);
                status.total_size = Some(metadata.total_size);
            }
            return Ok(status);
        }

        let progress = self.manager.active_progress(manga_id, chapter_number);

        if self.queue.contains(manga_id, chapter_number).await {
            let state = if progress.is_some() {
                ChapterStatus::Downloading
            } else if self.manager.is_paused() {
                ChapterStatus::Paused
            } else {
                ChapterStatus::Queued
            };
            let mut status = ChapterDownloadStatus::new(manga_id, chapter_number, state);
            status.progress = progress;
            return Ok(status);
        }

        if progress.is_some() {
            let mut status = ChapterDownloadStatus::new(manga_id, chapter_number, ChapterStatus::Downloading);
            status.progress = progress;
            return Ok(status);
        }

        if let Some(failure) = self.manager.last_failure(manga_id, chapter_number) {
            let mut status = ChapterDownloadStatus::new(manga_id, chapter_number, ChapterStatus::Failed);
            status.error = Some(failure.error);
            return Ok(status);
        }

        Ok(ChapterDownloadStatus::new(manga_id, chapter_number, ChapterStatus::Queued))
    }

    /// Look up every chapter concurrently
    pub async fn get_batch_download_status(&self, manga_id: &str, chapter_numbers: &[String]) -> BatchStatusReport {
        let statuses = join_all(
            chapter_numbers
                .iter()
                .map(|chapter| self.get_chapter_download_status(manga_id, chapter)),
        )
        .await;

        let mut summary = StatusSummary::default();
        for status in &statuses {
            summary.count(status.status);
        }
        BatchStatusReport { statuses, summary }
    }

    pub fn invalidate(&self, manga_id: &str, chapter_number: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&ChapterKey::new(manga_id, chapter_number));
    }

    pub fn invalidate_manga(&self, manga_id: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|key, _| key.manga_id != manga_id);
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Drop cached entries touched by download events until the channel closes
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<DownloadEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.invalidate(event.manga_id(), event.chapter_number()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "status cache missed events, clearing");
                    self.clear_cache();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
