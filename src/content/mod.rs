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


//! Downloaded chapter content
//!
//! - [`store`] - the [`ContentStore`]: saving, reading, deleting and evicting chapters
//! - [`layout`] - directory and file naming under the downloads root
//! - [`eviction`] - cleanup planning (intelligent and aggressive tiers)
//! - [`models`] - metadata, usage statistics and report types
//! - [`space`] - device free-space probes

pub mod eviction;
pub mod layout;
pub mod models;
pub mod space;
pub mod store;

pub use models::{
    ChapterImage, ChapterKey, ChapterMetadata, CleanupReport, DetailedStorageStats, ImageStatus,
    ManualCleanupOptions, PageRequest, StorageStats, StorageUsageStats,
};
pub use space::{FixedSpaceProbe, SpaceProbe, SystemSpaceProbe};
pub use store::{ContentStore, SaveProgress};
