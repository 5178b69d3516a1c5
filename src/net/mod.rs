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


//! Network access for image bytes
//!
//! [`fetcher`] streams single images to disk; [`retry`] wraps any fallible
//! async operation in exponential backoff. Both chapter downloads and the image
//! cache go through these.

pub mod fetcher;
pub mod retry;

pub use fetcher::{ChunkCallback, HttpImageFetcher, ImageFetcher};
pub use retry::{retry_with_backoff, RetryPolicy};
