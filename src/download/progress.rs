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


//! Chapter download progress
//!
//! Progress is tracked per chapter: pages finished out of the resolved page
//! count, plus bytes, a moving-average speed and an ETA. Chapter sizes are not
//! known up front, so the ETA extrapolates the average page size seen so far.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

/// Lifecycle of a single chapter download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
}

/// Progress snapshot for one chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterProgress {
    pub manga_id: String,
    pub chapter_number: String,

    pub pages_completed: usize,

    /// Resolved page count (0 until the chapter source has answered)
    pub total_pages: usize,

    pub bytes_downloaded: u64,

    /// 0.0 - 100.0
    pub percent_complete: f64,

    /// Bytes per second, moving average
    pub download_speed: f64,

    /// 0 if unknown
    pub eta_seconds: u64,

    pub state: DownloadState,
}

impl ChapterProgress {
    pub fn new(manga_id: impl Into<String>, chapter_number: impl Into<String>) -> Self {
        Self {
            manga_id: manga_id.into(),
            chapter_number: chapter_number.into(),
            pages_completed: 0,
            total_pages: 0,
            bytes_downloaded: 0,
            percent_complete: 0.0,
            download_speed: 0.0,
            eta_seconds: 0,
            state: DownloadState::Queued,
        }
    }

    fn calculate_percentage(&mut self) {
        self.percent_complete = if self.total_pages > 0 {
            (self.pages_completed as f64 / self.total_pages as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
    }

    fn calculate_eta(&mut self) {
        if self.download_speed <= 0.0 || self.pages_completed == 0 || self.total_pages == 0 {
            self.eta_seconds = 0;
            return;
        }
        let avg_page = self.bytes_downloaded as f64 / self.pages_completed as f64;
        let remaining_pages = self.total_pages.saturating_sub(self.pages_completed) as f64;
        self.eta_seconds = (avg_page * remaining_pages / self.download_speed) as u64;
    }

    /// Format download speed, e.g. "2.5 MB/s"
    pub fn speed_string(&self) -> String {
        format!("{:.1} MB/s", self.download_speed / 1_000_000.0)
    }

    /// Format ETA, e.g. "5m 30s"
    pub fn eta_string(&self) -> String {
        if self.eta_seconds == 0 {
            return "calculating...".to_string();
        }

        let hours = self.eta_seconds / 3600;
        let minutes = (self.eta_seconds % 3600) / 60;
        let seconds = self.eta_seconds % 60;

        if hours > 0 {
            format!("{}h {}m", hours, minutes)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}

/// Speed tracker with a sliding-window average
#[derive(Debug)]
pub struct SpeedTracker {
    samples: VecDeque<SpeedSample>,
    window_duration: Duration,
}

#[derive(Debug, Clone)]
struct SpeedSample {
    timestamp: Instant,
    /// Total bytes at this point in time
    position: u64,
}

impl SpeedTracker {
    /// Tracker with the default 10-second window
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(10))
    }

    pub fn with_window(window_duration: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window_duration,
        }
    }

    pub fn add_position(&mut self, position: u64) {
        let now = Instant::now();
        self.samples.push_back(SpeedSample {
            timestamp: now,
            position,
        });

        while let Some(sample) = self.samples.front() {
            if now.duration_since(sample.timestamp) > self.window_duration {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the window
    pub fn average_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };

        let bytes_delta = last.position.saturating_sub(first.position);
        let time_delta = last.timestamp.duration_since(first.timestamp).as_secs_f64();

        if time_delta > 0.0 {
            bytes_delta as f64 / time_delta
        } else {
            0.0
        }
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable progress state for one in-flight chapter
#[derive(Debug)]
pub struct ProgressTracker {
    progress: ChapterProgress,
    speed_tracker: SpeedTracker,
    last_update: Option<Instant>,
    /// Minimum interval between emitted updates
    update_interval: Duration,
}

impl ProgressTracker {
    pub fn new(manga_id: impl Into<String>, chapter_number: impl Into<String>) -> Self {
        let mut progress = ChapterProgress::new(manga_id, chapter_number);
        progress.state = DownloadState::Downloading;
        Self {
            progress,
            speed_tracker: SpeedTracker::new(),
            last_update: None,
            update_interval: Duration::from_millis(200),
        }
    }

    pub fn set_total_pages(&mut self, total_pages: usize) {
        self.progress.total_pages = total_pages;
        self.progress.calculate_percentage();
    }

    /// Account for a written chunk. Returns true when an update should be emitted.
    pub fn add_bytes(&mut self, bytes: u64) -> bool {
        self.progress.bytes_downloaded += bytes;
        self.speed_tracker.add_position(self.progress.bytes_downloaded);
        self.progress.download_speed = self.speed_tracker.average_speed();
        self.progress.calculate_eta();
        self.throttle()
    }

    /// Record a finished page. Always worth emitting.
    pub fn page_completed(&mut self) {
        self.progress.pages_completed += 1;
        self.progress.calculate_percentage();
        self.progress.calculate_eta();
        self.last_update = Some(Instant::now());
    }

    pub fn set_state(&mut self, state: DownloadState) {
        self.progress.state = state;
    }

    pub fn snapshot(&self) -> ChapterProgress {
        self.progress.clone()
    }

    fn throttle(&mut self) -> bool {
        let now = Instant::now();
        match self.last_update {
            Some(last) if now.duration_since(last) < self.update_interval => false,
            _ => {
                self.last_update = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_by_pages() {
        let mut tracker = ProgressTracker::new("m1", "1");
        tracker.set_total_pages(4);
        tracker.page_completed();
        assert_eq!(tracker.snapshot().percent_complete, 25.0);
        tracker.page_completed();
        tracker.page_completed();
        tracker.page_completed();
        assert_eq!(tracker.snapshot().percent_complete, 100.0);
    }

    #[test]
    fn test_zero_pages_is_zero_percent() {
        let tracker = ProgressTracker::new("m1", "1");
        assert_eq!(tracker.snapshot().percent_complete, 0.0);
        assert_eq!(tracker.snapshot().state, DownloadState::Downloading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_and_eta() {
        let mut tracker = ProgressTracker::new("m1", "1");
        tracker.set_total_pages(4);

        tracker.add_bytes(0);
        tokio::time::advance(Duration::from_secs(1)).await;
        tracker.add_bytes(1_000_000);
        tracker.page_completed();

        let progress = tracker.snapshot();
        assert_eq!(progress.download_speed, 1_000_000.0);
        // Three pages of ~1 MB left at 1 MB/s
        assert_eq!(progress.eta_seconds, 3);
        assert_eq!(progress.speed_string(), "1.0 MB/s");
        assert_eq!(progress.eta_string(), "3s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_are_throttled() {
        let mut tracker = ProgressTracker::new("m1", "1");
        assert!(tracker.add_bytes(10));
        assert!(!tracker.add_bytes(10));
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(tracker.add_bytes(10));
    }

    #[test]
    fn test_eta_string_formats() {
        let mut progress = ChapterProgress::new("m1", "1");
        progress.eta_seconds = 3_700;
        assert_eq!(progress.eta_string(), "1h 1m");
        progress.eta_seconds = 90;
        assert_eq!(progress.eta_string(), "1m 30s");
    }
}
