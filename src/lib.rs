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


//! MangaShelf core: offline chapter storage and download orchestration
//!
//! # Layout
//! - [`content`] - downloaded chapter pages on disk, quota and eviction
//! - [`image_cache`] - covers, banners and search thumbnails
//! - [`search_cache`] - recent search result payloads
//! - [`download`] - queue, manager, batch sessions and status
//! - [`engine`] - builds and runs all of the above
//! - [`bridge`] - C ABI for the mobile host
//!
//! Supporting modules: [`storage`] (SQLite-backed JSON documents),
//! [`settings`], [`config`], [`events`], [`net`], [`clock`], [`error`].

pub mod bridge;
pub mod clock;
pub mod config;
pub mod content;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod image_cache;
pub mod net;
pub mod search_cache;
pub mod settings;
pub mod storage;

pub use engine::Engine;
pub use error::{Result, ShelfError};
