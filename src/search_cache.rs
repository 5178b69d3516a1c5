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


//! Recent search results
//!
//! Keeps the raw result payload of the last [`MAX_CACHED_QUERIES`] searches for
//! an hour so going back to a search does not hit the network again. Queries
//! are matched case-insensitively after trimming. Reading an entry does not
//! refresh it: the oldest search is the first to go.

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::storage::{keys, KeyValueStore};
use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const MAX_CACHED_QUERIES: usize = 10;
pub const SEARCH_RESULTS_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSearch {
    pub query: String,
    pub results: serde_json::Value,
    pub cached_at: DateTime<Utc>,
}

pub struct SearchResultsCache {
    kv: KeyValueStore,
    clock: Arc<dyn Clock>,
    entries: Mutex<LruCache<String, CachedSearch>>,
}

impl std::fmt::Debug for SearchResultsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchResultsCache").finish_non_exhaustive()
    }
}

fn normalize(query: &str) -> String {
    query.trim().to_lowercase()
}

fn capacity() -> NonZeroUsize {
    NonZeroUsize::new(MAX_CACHED_QUERIES).unwrap_or(NonZeroUsize::MIN)
}

impl SearchResultsCache {
    /// Restore persisted searches, dropping expired ones
    pub async fn load(kv: KeyValueStore, clock: Arc<dyn Clock>) -> Self {
        let saved: Vec<CachedSearch> = kv
            .get_or_default(keys::SEARCH_RESULTS_CACHE)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load search results cache, starting empty");
                Vec::new()
            });

        let now = clock.now();
        let mut entries = LruCache::new(capacity());
        // Persisted oldest first
        for entry in saved {
            if now - entry.cached_at <= Duration::minutes(SEARCH_RESULTS_TTL_MINUTES) {
                entries.put(normalize(&entry.query), entry);
            }
        }

        Self {
            kv,
            clock,
            entries: Mutex::new(entries),
        }
    }

    pub async fn in_memory() -> Result<Self> {
        Ok(Self::load(KeyValueStore::in_memory().await?, Arc::new(SystemClock)).await)
    }

    pub async fn get(&self, query: &str) -> Option<serde_json::Value> {
        let key = normalize(query);
        let mut entries = self.entries.lock().await;
        let expired = match entries.peek(&key) {
            None => return None,
            Some(entry) => self.is_expired(entry),
        };
        if expired {
            entries.pop(&key);
            self.persist(&entries).await;
            return None;
        }
        entries.peek(&key).map(|entry| entry.results.clone())
    }

    pub async fn put(&self, query: &str, results: serde_json::Value) {
        let key = normalize(query);
        if key.is_empty() {
            return;
        }
        let mut entries = self.entries.lock().await;
        let entry = CachedSearch {
            query: query.trim().to_string(),
            results,
            cached_at: self.clock.now(),
        };
        if let Some((evicted, _)) = entries.push(key.clone(), entry).filter(|(k, _)| *k != key) {
            tracing::debug!(query = %evicted, "search results evicted");
        }
        self.persist(&entries).await;
    }

    pub async fn remove(&self, query: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let removed = entries.pop(&normalize(query)).is_some();
        if removed {
            self.persist(&entries).await;
        }
        removed
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.persist(&entries).await;
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Cached queries, most recent first
    pub async fn queries(&self) -> Vec<String> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(_, entry)| entry.query.clone())
            .collect()
    }

    fn is_expired(&self, entry: &CachedSearch) -> bool {
        self.clock.now() - entry.cached_at > Duration::minutes(SEARCH_RESULTS_TTL_MINUTES)
    }

    async fn persist(&self, entries: &LruCache<String, CachedSearch>) {
        let snapshot: Vec<&CachedSearch> = entries.iter().rev().map(|(_, entry)| entry).collect();
        if let Err(e) = self.kv.set(keys::SEARCH_RESULTS_CACHE, &snapshot).await {
            tracing::warn!(error = %e, "failed to persist search results cache");
        }
    }
}
