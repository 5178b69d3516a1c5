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


//! Persisted engine state
//!
//! Bookkeeping (chapter metadata, settings, usage stats, queue, image cache
//! metadata) is stored as JSON documents in a SQLite `kv_store` table.
//! Content bytes never go through here; they live in the directories managed
//! by [`crate::content`] and [`crate::image_cache`].
//!
//! # Usage Example
//! ```no_run
//! use mangashelf_core::storage::{Database, KeyValueStore, keys};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new("./mangashelf.db").await?;
//! let kv = KeyValueStore::new(db);
//! kv.set(keys::DOWNLOAD_QUEUE, &Vec::<String>::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod debounce;
pub mod kv;
pub mod migrations;

pub use database::Database;
pub use debounce::Debouncer;
pub use kv::{keys, KeyValueStore};
