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


//! Flush-after-inactivity primitive
//!
//! A [`Debouncer`] runs its action once `delay` has passed without another
//! [`schedule`](Debouncer::schedule) call. Bursts of bookkeeping updates
//! therefore cost one write. A crash inside the window loses that window's
//! bookkeeping, never content.
//!
//! Timing goes through `tokio::time`, so tests pause the runtime clock
//! (`#[tokio::test(start_paused = true)]`) and step through the window.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type FlushAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub struct Debouncer {
    delay: Duration,
    generation: Arc<AtomicU64>,
    pending: Arc<AtomicBool>,
    action: FlushAction,
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.delay)
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Debouncer {
    pub fn new<F, Fut>(delay: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            delay,
            generation: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(AtomicBool::new(false)),
            action: Arc::new(move || action().boxed()),
        }
    }

    /// (Re)start the inactivity window. Must be called inside a Tokio runtime.
    pub fn schedule(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.store(true, Ordering::SeqCst);

        let delay = self.delay;
        let current = Arc::clone(&self.generation);
        let pending = Arc::clone(&self.pending);
        let action = Arc::clone(&self.action);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A later schedule() owns the flush now
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            if pending.swap(false, Ordering::SeqCst) {
                action().await;
            }
        });
    }

    /// Run the action immediately if a flush is pending
    pub async fn flush_now(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.pending.swap(false, Ordering::SeqCst) {
            (self.action)().await;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}
