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


//! Chapter page resolution
//!
//! Turning a chapter URL into page image URLs is the fetch layer's business;
//! the engine only sees it through [`ChapterSource`]. Hosts that scrape
//! chapters themselves hand the page lists over through
//! [`RegisteredPagesSource`].

use crate::content::PageRequest;
use crate::error::{Result, ShelfError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait ChapterSource: Send + Sync {
    /// Page images of a chapter, in reading order
    async fn resolve_pages(
        &self,
        manga_id: &str,
        chapter_number: &str,
        chapter_url: &str,
    ) -> Result<Vec<PageRequest>>;
}

/// Page lists registered ahead of time by the host
#[derive(Debug, Default)]
pub struct RegisteredPagesSource {
    pages: RwLock<HashMap<(String, String), Vec<PageRequest>>>,
}

impl RegisteredPagesSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, manga_id: &str, chapter_number: &str, pages: Vec<PageRequest>) {
        self.pages
            .write()
            .await
            .insert((manga_id.to_string(), chapter_number.to_string()), pages);
    }

    pub async fn unregister(&self, manga_id: &str, chapter_number: &str) -> bool {
        self.pages
            .write()
            .await
            .remove(&(manga_id.to_string(), chapter_number.to_string()))
            .is_some()
    }
}

#[async_trait]
impl ChapterSource for RegisteredPagesSource {
    async fn resolve_pages(
        &self,
        manga_id: &str,
        chapter_number: &str,
        _chapter_url: &str,
    ) -> Result<Vec<PageRequest>> {
        let pages = self
            .pages
            .read()
            .await
            .get(&(manga_id.to_string(), chapter_number.to_string()))
            .cloned();

        match pages {
            Some(pages) if !pages.is_empty() => Ok(pages),
            _ => Err(ShelfError::ChapterResolutionFailed {
                manga_id: manga_id.to_string(),
                chapter_number: chapter_number.to_string(),
                message: "no pages registered".to_string(),
            }),
        }
    }
}
