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


//! Streaming image transfers
//!
//! [`ImageFetcher`] is the seam between the engine and the network. The
//! production implementation streams an HTTP response body straight into a
//! file through a buffered writer, reporting each chunk so progress and speed
//! can be recomputed as bytes arrive.
//!
//! # Transfer rules
//! - Only `http`/`https` URLs are accepted
//! - Every transfer is bounded by the configured timeout; a hung connection
//!   fails instead of holding its concurrency slot forever
//! - A failed transfer never leaves a partial file behind

use crate::config::EngineConfig;
use crate::error::{Result, ShelfError};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

const DOWNLOAD_BUFF_SZ: usize = 64 * 1024;

/// Called with the length of every chunk written
pub type ChunkCallback<'a> = &'a (dyn Fn(u64) + Send + Sync);

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        on_chunk: Option<ChunkCallback<'_>>,
    ) -> Result<u64>;
}

/// reqwest-backed fetcher
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpImageFetcher {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            timeout: config.transfer_timeout(),
        })
    }

    fn validate_url(url: &str) -> Result<()> {
        let parsed = url::Url::parse(url)
            .map_err(|e| ShelfError::InvalidDownloadUrl(format!("{}: {}", url, e)))?;
        match parsed.scheme() {
            "http" | "https" => Ok(()),
            other => Err(ShelfError::InvalidDownloadUrl(format!(
                "unsupported scheme '{}' in {}",
                other, url
            ))),
        }
    }

    async fn transfer(
        &self,
        url: &str,
        dest: &Path,
        on_chunk: Option<ChunkCallback<'_>>,
    ) -> Result<u64> {
        let response = self.client.get(url).send().await.map_err(|e| {
            ShelfError::network_error(format!("Request failed for {}: {}", url, e), true)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ShelfError::UnexpectedStatusCode {
                status_code: status.as_u16(),
                url: url.to_string(),
            });
        }

        let file = File::create(dest).await?;
        let mut writer = BufWriter::with_capacity(DOWNLOAD_BUFF_SZ, file);
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| {
                ShelfError::network_error(format!("Stream error for {}: {}", url, e), true)
            })?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(callback) = on_chunk {
                callback(chunk.len() as u64);
            }
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        if written == 0 {
            return Err(ShelfError::DownloadFailed(format!("Empty response body for {}", url)));
        }

        Ok(written)
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        on_chunk: Option<ChunkCallback<'_>>,
    ) -> Result<u64> {
        Self::validate_url(url)?;

        let result = match tokio::time::timeout(self.timeout, self.transfer(url, dest, on_chunk)).await {
            Ok(result) => result,
            Err(_) => Err(ShelfError::Timeout(self.timeout.as_secs())),
        };

        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }
}
