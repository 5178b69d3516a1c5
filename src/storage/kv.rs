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


//! Persisted JSON documents keyed by name
//!
//! Each engine component loads its document once at startup and writes it
//! back (usually through a [`Debouncer`](super::Debouncer)). A document that
//! fails to parse is logged and treated as absent so the component starts
//! from its defaults instead of refusing to run.

use crate::error::Result;
use crate::storage::Database;
use serde::{de::DeserializeOwned, Serialize};

/// Names of the persisted documents
pub mod keys {
    pub const CHAPTER_DOWNLOADS_METADATA: &str = "chapter_downloads_metadata";
    pub const DOWNLOAD_SETTINGS: &str = "download_settings";
    pub const DOWNLOAD_USAGE_STATS: &str = "download_usage_stats";
    pub const IMAGE_CACHE_METADATA: &str = "image_cache_metadata";
    pub const DOWNLOAD_QUEUE: &str = "download_queue";
    pub const SEARCH_RESULTS_CACHE: &str = "search_results_cache";
}

#[derive(Debug, Clone)]
pub struct KeyValueStore {
    db: Database,
}

impl KeyValueStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// In-memory store, for tests and hosts without a writable data dir
    pub async fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::new_in_memory().await?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Raw JSON text for a key
    pub async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(value)
    }

    /// Load and decode a document
    ///
    /// Returns `Ok(None)` when the key is absent or its JSON is corrupt.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.get_raw(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding corrupt persisted state");
                Ok(None)
            }
        }
    }

    pub async fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        Ok(self.get(key).await?.unwrap_or_default())
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.set_raw(key, &json).await
    }

    pub async fn set_raw(&self, key: &str, json: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Returns whether the key existed
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_set_and_get() {
        let kv = KeyValueStore::in_memory().await.unwrap();
        let mut doc = HashMap::new();
        doc.insert("a".to_string(), 1u32);

        kv.set("doc", &doc).await.unwrap();
        let loaded: Option<HashMap<String, u32>> = kv.get("doc").await.unwrap();
        assert_eq!(loaded, Some(doc));

        // Overwrite
        kv.set("doc", &HashMap::<String, u32>::new()).await.unwrap();
        let loaded: HashMap<String, u32> = kv.get_or_default("doc").await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document_reads_as_absent() {
        let kv = KeyValueStore::in_memory().await.unwrap();
        kv.set_raw(keys::DOWNLOAD_SETTINGS, "{not json").await.unwrap();

        let loaded: Option<HashMap<String, u32>> = kv.get(keys::DOWNLOAD_SETTINGS).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let kv = KeyValueStore::in_memory().await.unwrap();
        kv.set("k", &1u8).await.unwrap();
        assert!(kv.remove("k").await.unwrap());
        assert!(!kv.remove("k").await.unwrap());
        assert!(kv.get_raw("k").await.unwrap().is_none());
    }
}
