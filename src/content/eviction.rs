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


//! Eviction planning
//!
//! Two tiers, both pure functions over a snapshot of stored chapters:
//!
//! - **Intelligent**: runs when usage exceeds 85% of the quota. Chapters are
//!   ranked by last access (a never-read chapter counts from its download),
//!   then access count, then download time, and removed until usage is at most
//!   70% of the quota.
//! - **Aggressive**: runs when device free space drops below the floor. Oldest
//!   downloads go first regardless of use, until the floor is restored.

use chrono::{DateTime, Utc};

pub const CLEANUP_TRIGGER_RATIO: f64 = 0.85;
pub const CLEANUP_TARGET_RATIO: f64 = 0.70;

#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub manga_id: String,
    pub chapter_number: String,
    pub size: u64,
    pub last_access: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub downloaded_at: DateTime<Utc>,
}

impl EvictionCandidate {
    /// Last time the chapter was read, or when it arrived if never read
    pub fn idle_since(&self) -> DateTime<Utc> {
        self.last_access.unwrap_or(self.downloaded_at)
    }
}

fn ratio_of(quota: u64, ratio: f64) -> u64 {
    (quota as f64 * ratio) as u64
}

pub fn sort_least_valuable_first(candidates: &mut [EvictionCandidate]) {
    candidates.sort_by(|a, b| {
        a.idle_since()
            .cmp(&b.idle_since())
            .then(a.access_count.cmp(&b.access_count))
            .then(a.downloaded_at.cmp(&b.downloaded_at))
    });
}

pub fn sort_oldest_first(candidates: &mut [EvictionCandidate]) {
    candidates.sort_by(|a, b| a.downloaded_at.cmp(&b.downloaded_at));
}

/// Take candidates in order until `total` is at most `target`
pub fn take_until_within(candidates: Vec<EvictionCandidate>, total: u64, target: u64) -> Vec<EvictionCandidate> {
    let mut remaining = total;
    candidates
        .into_iter()
        .take_while(|candidate| {
            if remaining <= target {
                return false;
            }
            remaining = remaining.saturating_sub(candidate.size);
            true
        })
        .collect()
}

/// Chapters to delete for the intelligent tier, `None` when usage is under the trigger
pub fn intelligent_plan(
    mut candidates: Vec<EvictionCandidate>,
    total: u64,
    quota: u64,
) -> Option<Vec<EvictionCandidate>> {
    if total <= ratio_of(quota, CLEANUP_TRIGGER_RATIO) {
        return None;
    }
    sort_least_valuable_first(&mut candidates);
    Some(take_until_within(candidates, total, ratio_of(quota, CLEANUP_TARGET_RATIO)))
}

/// Chapters to delete for the aggressive tier, `None` when free space is above the floor
pub fn aggressive_plan(
    mut candidates: Vec<EvictionCandidate>,
    free_space: u64,
    floor: u64,
) -> Option<Vec<EvictionCandidate>> {
    if free_space >= floor {
        return None;
    }
    sort_oldest_first(&mut candidates);

    let mut freed = 0u64;
    Some(
        candidates
            .into_iter()
            .take_while(|candidate| {
                if free_space + freed >= floor {
                    return false;
                }
                freed += candidate.size;
                true
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn candidate(chapter: &str, size: u64, last_access_days: Option<i64>, count: u64, downloaded_days: i64) -> EvictionCandidate {
        EvictionCandidate {
            manga_id: "m1".to_string(),
            chapter_number: chapter.to_string(),
            size,
            last_access: last_access_days.map(|d| base() + Duration::days(d)),
            access_count: count,
            downloaded_at: base() + Duration::days(downloaded_days),
        }
    }

    fn chapters(plan: &[EvictionCandidate]) -> Vec<&str> {
        plan.iter().map(|c| c.chapter_number.as_str()).collect()
    }

    #[test]
    fn test_stale_rarely_read_chapter_goes_first() {
        let a = candidate("A", 30, Some(1), 1, 0);
        let b = candidate("B", 30, Some(10), 5, 0);
        let plan = intelligent_plan(vec![b, a], 90, 100).unwrap();
        assert_eq!(chapters(&plan), vec!["A"]);
    }

    #[test]
    fn test_tie_breaks_on_count_then_download_time() {
        let mut list = vec![
            candidate("late", 10, Some(3), 2, 5),
            candidate("busy", 10, Some(3), 9, 0),
            candidate("early", 10, Some(3), 2, 1),
            candidate("never", 10, None, 0, 9),
        ];
        sort_least_valuable_first(&mut list);
        assert_eq!(chapters(&list), vec!["early", "late", "busy", "never"]);
    }

    #[test]
    fn test_intelligent_stops_at_target() {
        let list = (0..10).map(|i| candidate(&i.to_string(), 10, Some(i), 0, 0)).collect();
        // 100 bytes against a quota of 100: trim to 70
        let plan = intelligent_plan(list, 100, 100).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(chapters(&plan), vec!["0", "1", "2"]);
    }

    #[test]
    fn test_intelligent_not_triggered_below_threshold() {
        let list = vec![candidate("A", 85, None, 0, 0)];
        assert!(intelligent_plan(list, 85, 100).is_none());
    }

    #[test]
    fn test_aggressive_ignores_access_pattern() {
        let list = vec![
            candidate("new-unread", 50, None, 0, 5),
            candidate("old-popular", 50, Some(30), 99, 0),
        ];
        let plan = aggressive_plan(list, 10, 50).unwrap();
        assert_eq!(chapters(&plan), vec!["old-popular"]);
        assert!(aggressive_plan(vec![], 60, 50).is_none());
    }
}
