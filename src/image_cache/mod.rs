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


//! Image cache for covers, banners and search thumbnails
//!
//! Separate from downloaded chapters: its own directory, index, size limit
//! and eviction. See [`cache`] for the on-disk layout.

pub mod cache;
pub mod models;

pub use cache::ImageCache;
pub use models::{CacheContext, CacheEntry, ImageCacheStats};
