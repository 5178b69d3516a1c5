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


//! On-disk layout of downloaded chapters
//!
//! ```text
//! <downloads_root>/
//!   manga_<id>/
//!     chapter_<n>/
//!       page_001.jpg
//!       page_002.png
//!       metadata.json
//! ```
//!
//! Ids are sanitized before they become path components; the metadata index
//! keeps the original ids.

use crate::error::{Result, ShelfError};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const METADATA_FILE: &str = "metadata.json";

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "gif"];

lazy_static! {
    static ref PAGE_FILE: Regex = Regex::new(r"^page_(\d+)\.([A-Za-z0-9]+)$").unwrap();
}

/// Replace anything outside `[A-Za-z0-9._-]` so an id is a single safe path component
pub fn sanitize_component(id: &str) -> String {
    let cleaned: String = id
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Page number of a `page_NNN.ext` file name
pub fn parse_page_number(file_name: &str) -> Option<u32> {
    PAGE_FILE
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Image extension taken from the URL path, `jpg` when unknown
pub fn extension_for_url(url: &str) -> &'static str {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_default();
    IMAGE_EXTENSIONS
        .iter()
        .find(|ext| path.ends_with(&format!(".{}", ext)))
        .copied()
        .unwrap_or("jpg")
}

/// A page file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFile {
    pub page_number: u32,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ContentLayout {
    root: PathBuf,
}

impl ContentLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manga_dir(&self, manga_id: &str) -> PathBuf {
        self.root.join(format!("manga_{}", sanitize_component(manga_id)))
    }

    pub fn chapter_dir(&self, manga_id: &str, chapter_number: &str) -> PathBuf {
        self.manga_dir(manga_id)
            .join(format!("chapter_{}", sanitize_component(chapter_number)))
    }

    pub fn metadata_path(&self, manga_id: &str, chapter_number: &str) -> PathBuf {
        self.chapter_dir(manga_id, chapter_number).join(METADATA_FILE)
    }

    pub fn page_path(&self, manga_id: &str, chapter_number: &str, page_number: u32, ext: &str) -> PathBuf {
        self.chapter_dir(manga_id, chapter_number)
            .join(format!("page_{:03}.{}", page_number, ext))
    }

    /// Existing file for a page under any image extension
    pub async fn find_page(&self, manga_id: &str, chapter_number: &str, page_number: u32) -> Option<PageFile> {
        for ext in IMAGE_EXTENSIONS {
            let path = self.page_path(manga_id, chapter_number, page_number, ext);
            if let Ok(meta) = fs::metadata(&path).await {
                if meta.is_file() {
                    return Some(PageFile {
                        page_number,
                        path,
                        size: meta.len(),
                    });
                }
            }
        }
        None
    }

    /// Page files of a chapter, sorted by page number. Missing directory yields an empty list.
    pub async fn list_pages(&self, manga_id: &str, chapter_number: &str) -> Result<Vec<PageFile>> {
        let dir = self.chapter_dir(manga_id, chapter_number);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ShelfError::FileIoError(format!(
                    "Failed to read directory {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut pages = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(page_number) = name.to_str().and_then(parse_page_number) else {
                continue;
            };
            let meta = entry.metadata().await?;
            if meta.is_file() {
                pages.push(PageFile {
                    page_number,
                    path: entry.path(),
                    size: meta.len(),
                });
            }
        }

        pages.sort_by_key(|page| page.page_number);
        Ok(pages)
    }

    /// Remove a chapter directory, then the manga directory if that left it empty.
    /// Returns whether the chapter directory existed.
    pub async fn remove_chapter(&self, manga_id: &str, chapter_number: &str) -> Result<bool> {
        let dir = self.chapter_dir(manga_id, chapter_number);
        let existed = match fs::remove_dir_all(&dir).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(ShelfError::FileIoError(format!(
                    "Failed to remove {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        self.remove_if_empty(&self.manga_dir(manga_id)).await?;
        Ok(existed)
    }

    async fn remove_if_empty(&self, dir: &Path) -> Result<()> {
        if dir == self.root {
            return Ok(());
        }
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if entries.next_entry().await?.is_none() {
            fs::remove_dir(dir).await?;
        }
        Ok(())
    }
}

/// Temp sibling used while a file is being written
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    path.with_file_name(format!(".{}.tmp", name))
}

/// Write to a temp sibling, sync, then rename into place
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = temp_path_for(path);

    fs::write(&temp_path, contents).await.map_err(|e| {
        ShelfError::FileIoError(format!(
            "Failed to write temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;

    let file = fs::OpenOptions::new().write(true).open(&temp_path).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await.map_err(|e| {
        ShelfError::FileIoError(format!(
            "Failed to rename {} to {}: {}",
            temp_path.display(),
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("one-piece"), "one-piece");
        assert_eq!(sanitize_component("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_component(".."), "_");
        assert_eq!(sanitize_component("10.5"), "10.5");
    }

    #[test]
    fn test_parse_page_number() {
        assert_eq!(parse_page_number("page_001.jpg"), Some(1));
        assert_eq!(parse_page_number("page_120.webp"), Some(120));
        assert_eq!(parse_page_number("metadata.json"), None);
        assert_eq!(parse_page_number(".page_001.jpg.tmp"), None);
    }

    #[test]
    fn test_extension_for_url() {
        assert_eq!(extension_for_url("https://cdn.example.com/1.PNG?x=1"), "png");
        assert_eq!(extension_for_url("https://cdn.example.com/image"), "jpg");
        assert_eq!(extension_for_url("opaque"), "jpg");
    }

    #[test]
    fn test_paths() {
        let layout = ContentLayout::new("/data");
        assert_eq!(
            layout.page_path("m1", "3", 7, "jpg"),
            PathBuf::from("/data/manga_m1/chapter_3/page_007.jpg")
        );
        assert_eq!(
            layout.metadata_path("m1", "3"),
            PathBuf::from("/data/manga_m1/chapter_3/metadata.json")
        );
    }

    #[tokio::test]
    async fn test_list_pages_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ContentLayout::new(temp_dir.path());
        let dir = layout.chapter_dir("m1", "1");
        fs::create_dir_all(&dir).await.unwrap();

        for name in ["page_010.jpg", "page_002.png", "page_001.jpg", "metadata.json"] {
            fs::write(dir.join(name), b"data").await.unwrap();
        }

        let pages = layout.list_pages("m1", "1").await.unwrap();
        let numbers: Vec<u32> = pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 2, 10]);
        assert!(layout.list_pages("m1", "missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_chapter_cleans_manga_dir() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ContentLayout::new(temp_dir.path());
        fs::create_dir_all(layout.chapter_dir("m1", "1")).await.unwrap();
        fs::create_dir_all(layout.chapter_dir("m1", "2")).await.unwrap();

        assert!(layout.remove_chapter("m1", "1").await.unwrap());
        assert!(layout.manga_dir("m1").exists());

        assert!(layout.remove_chapter("m1", "2").await.unwrap());
        assert!(!layout.manga_dir("m1").exists());
        assert!(temp_dir.path().exists());

        assert!(!layout.remove_chapter("m1", "2").await.unwrap());
    }

    #[tokio::test]
    async fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("metadata.json");
        atomic_write(&file, b"{}").await.unwrap();
        assert_eq!(fs::read_to_string(&file).await.unwrap(), "{}");
        assert!(!temp_path_for(&file).exists());
    }
}
