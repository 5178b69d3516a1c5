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


//! Persisted download queue
//!
//! An ordered set of pending chapters, written through to the key-value store
//! on every change so a restart picks up where the previous run stopped. Items
//! stay queued while they transfer; the manager removes them when they finish.

use crate::clock::Clock;
use crate::content::ChapterKey;
use crate::error::Result;
use crate::storage::{keys, KeyValueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{futures::Notified, Notify, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub manga_id: String,
    pub chapter_number: String,
    pub chapter_url: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn key(&self) -> ChapterKey {
        ChapterKey::new(&self.manga_id, &self.chapter_number)
    }

    fn is(&self, manga_id: &str, chapter_number: &str) -> bool {
        self.manga_id == manga_id && self.chapter_number == chapter_number
    }
}

pub struct DownloadQueue {
    kv: KeyValueStore,
    clock: Arc<dyn Clock>,
    items: RwLock<Vec<QueueItem>>,
    notify: Notify,
}

impl std::fmt::Debug for DownloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadQueue").finish_non_exhaustive()
    }
}

impl DownloadQueue {
    /// Load the persisted queue. Corrupt state starts an empty queue.
    pub async fn load(kv: KeyValueStore, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut items: Vec<QueueItem> = kv.get_or_default(keys::DOWNLOAD_QUEUE).await?;

        // Older writers may have left duplicates behind
        let mut seen = HashSet::new();
        items.retain(|item| seen.insert(item.key()));

        if !items.is_empty() {
            tracing::info!(count = items.len(), "resuming persisted download queue");
        }

        Ok(Self {
            kv,
            clock,
            items: RwLock::new(items),
            notify: Notify::new(),
        })
    }

    /// Append a chapter. Returns false when it is already queued.
    pub async fn add_to_queue(&self, manga_id: &str, chapter_number: &str, chapter_url: &str) -> Result<bool> {
        let mut items = self.items.write().await;
        if items.iter().any(|item| item.is(manga_id, chapter_number)) {
            return Ok(false);
        }

        let mut updated = items.clone();
        updated.push(QueueItem {
            manga_id: manga_id.to_string(),
            chapter_number: chapter_number.to_string(),
            chapter_url: chapter_url.to_string(),
            enqueued_at: self.clock.now(),
        });
        self.kv.set(keys::DOWNLOAD_QUEUE, &updated).await?;
        *items = updated;
        drop(items);

        tracing::debug!(manga_id, chapter = chapter_number, "queued");
        self.notify.notify_one();
        Ok(true)
    }

    /// Returns whether the item was queued
    pub async fn remove_from_queue(&self, manga_id: &str, chapter_number: &str) -> Result<bool> {
        let mut items = self.items.write().await;
        let Some(position) = items.iter().position(|item| item.is(manga_id, chapter_number)) else {
            return Ok(false);
        };

        let mut updated = items.clone();
        updated.remove(position);
        self.kv.set(keys::DOWNLOAD_QUEUE, &updated).await?;
        *items = updated;
        Ok(true)
    }

    /// Drop every queued chapter of a manga, returning what was removed
    pub async fn remove_manga(&self, manga_id: &str) -> Result<Vec<QueueItem>> {
        let mut items = self.items.write().await;
        let (removed, kept): (Vec<QueueItem>, Vec<QueueItem>) =
            items.iter().cloned().partition(|item| item.manga_id == manga_id);
        if removed.is_empty() {
            return Ok(removed);
        }

        self.kv.set(keys::DOWNLOAD_QUEUE, &kept).await?;
        *items = kept;
        tracing::debug!(manga_id, count = removed.len(), "removed manga from queue");
        Ok(removed)
    }

    pub async fn get_queued_items(&self) -> Vec<QueueItem> {
        self.items.read().await.clone()
    }

    pub async fn contains(&self, manga_id: &str, chapter_number: &str) -> bool {
        self.items
            .read()
            .await
            .iter()
            .any(|item| item.is(manga_id, chapter_number))
    }

    /// First queued item whose key is not in `excluding`
    pub async fn next_pending(&self, excluding: &HashSet<ChapterKey>) -> Option<QueueItem> {
        self.items
            .read()
            .await
            .iter()
            .find(|item| !excluding.contains(&item.key()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Completes after the next insertion (or an insertion that happened since
    /// the last wake-up was consumed)
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}
