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


//! Chapter downloads
//!
//! - [`queue`] - persisted list of chapters waiting to download
//! - [`manager`] - runs queued chapters with bounded concurrency
//! - [`batch`] - per-manga batch sessions driven by download events
//! - [`status`] - cached per-chapter status across store, queue and manager
//! - [`source`] - resolves a chapter to its page URLs
//! - [`progress`] - progress snapshots and speed tracking

pub mod batch;
pub mod manager;
pub mod progress;
pub mod queue;
pub mod source;
pub mod status;

pub use batch::{
    BatchDownloadOrchestrator, BatchDownloadState, BatchOptions, BatchStatus, ChapterInfo, FailedChapter,
    SessionInfo, StateSubscription,
};
pub use manager::{DownloadManager, FailureRecord};
pub use progress::{ChapterProgress, DownloadState};
pub use queue::{DownloadQueue, QueueItem};
pub use source::{ChapterSource, RegisteredPagesSource};
pub use status::{BatchStatusReport, ChapterDownloadStatus, ChapterStatus, DownloadStatusService, StatusSummary};
