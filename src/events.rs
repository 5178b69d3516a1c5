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


//! Download lifecycle events
//!
//! Events travel over a `tokio::sync::broadcast` channel. Every consumer owns a
//! receiver and drains it in its own task, so ordering per receiver is the
//! publish order. Consumers must key off `(manga_id, chapter_number)`; chapters
//! running in different slots complete in any order.

use crate::download::progress::ChapterProgress;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DownloadEvent {
    #[serde(rename = "download_completed")]
    Completed {
        manga_id: String,
        chapter_number: String,
        total_images: usize,
        total_size: u64,
    },

    #[serde(rename = "download_failed")]
    Failed {
        manga_id: String,
        chapter_number: String,
        error: String,
    },

    #[serde(rename = "download_progress")]
    Progress {
        manga_id: String,
        chapter_number: String,
        progress: ChapterProgress,
    },

    #[serde(rename = "download_deleted")]
    Deleted {
        manga_id: String,
        chapter_number: String,
    },
}

impl DownloadEvent {
    pub fn manga_id(&self) -> &str {
        match self {
            Self::Completed { manga_id, .. }
            | Self::Failed { manga_id, .. }
            | Self::Progress { manga_id, .. }
            | Self::Deleted { manga_id, .. } => manga_id,
        }
    }

    pub fn chapter_number(&self) -> &str {
        match self {
            Self::Completed { chapter_number, .. }
            | Self::Failed { chapter_number, .. }
            | Self::Progress { chapter_number, .. }
            | Self::Deleted { chapter_number, .. } => chapter_number,
        }
    }
}

/// Cloneable publishing handle
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DownloadEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to every current receiver. Having none is not an error.
    pub fn publish(&self, event: DownloadEvent) {
        tracing::trace!(manga_id = event.manga_id(), chapter = event.chapter_number(), ?event, "event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
