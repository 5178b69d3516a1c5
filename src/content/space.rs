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


//! Device free-space probing

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::Disks;

pub trait SpaceProbe: Send + Sync + std::fmt::Debug {
    /// Free bytes on the device holding `path`, `None` when it cannot be determined
    fn free_space(&self, path: &Path) -> Option<u64>;
}

/// Probe backed by the OS disk list
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpaceProbe;

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

impl SpaceProbe for SystemSpaceProbe {
    fn free_space(&self, path: &Path) -> Option<u64> {
        let target = nearest_existing_path(path);
        let target = std::fs::canonicalize(&target).unwrap_or(target);
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point containing the path wins
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// Probe reporting a settable value; `u64::MAX` stands for "unknown"
#[derive(Debug)]
pub struct FixedSpaceProbe {
    free: AtomicU64,
}

impl FixedSpaceProbe {
    pub fn new(free: Option<u64>) -> Self {
        Self {
            free: AtomicU64::new(free.unwrap_or(u64::MAX)),
        }
    }

    pub fn set(&self, free: Option<u64>) {
        self.free.store(free.unwrap_or(u64::MAX), Ordering::SeqCst);
    }
}

impl SpaceProbe for FixedSpaceProbe {
    fn free_space(&self, _path: &Path) -> Option<u64> {
        match self.free.load(Ordering::SeqCst) {
            u64::MAX => None,
            free => Some(free),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_probe() {
        let probe = FixedSpaceProbe::new(Some(42));
        assert_eq!(probe.free_space(Path::new("/")), Some(42));
        probe.set(None);
        assert_eq!(probe.free_space(Path::new("/")), None);
    }

    #[test]
    fn test_nearest_existing_path() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let missing = temp_dir.path().join("a/b/c");
        assert_eq!(nearest_existing_path(&missing), temp_dir.path());
    }
}
