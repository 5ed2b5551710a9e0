// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cluster bitmap allocator backing `$Bitmap` (§4.5.2).
//!
//! The core is read-only end to end, but the allocator is part of the
//! on-disk contract the reader validates against (a present bit must never
//! point past `total_clusters`, and `$Bitmap`'s byte layout is 1-bit-per-
//! cluster, LSB first within each byte) and is exercised directly by the
//! write path when the `write` feature is enabled elsewhere in the
//! workspace. Runs are expressed in cluster units, not bytes; callers scale
//! by `bytes_per_cluster` themselves.

use std::cell::Cell;

use diskit_err::{ctx, Error, Result};
use diskit_stream::Extent;

/// A contiguous run of free/allocated clusters as `(start_cluster, count)`.
pub type ClusterRun = Extent;

/// Counts allocator internals an implementer can assert on without reaching
/// into private state; this is the "injectable probe" the fragmentation
/// latch testable property calls for.
#[derive(Debug, Default)]
pub struct AllocatorProbe {
    contiguous_pass_attempts: Cell<u64>,
}

impl AllocatorProbe {
    pub fn contiguous_pass_attempts(&self) -> u64 {
        self.contiguous_pass_attempts.get()
    }
}

/// Windows (as a fraction of total capacity) searched for a single
/// contiguous run before falling back to a best-effort scatter-gather scan.
const WINDOW_DIVISORS: [u64; 4] = [4, 16, 64, 1];

pub struct ClusterBitmap {
    bits: Vec<u64>,
    total_clusters: u64,
    fragmented_mode: bool,
    probe: AllocatorProbe,
}

impl ClusterBitmap {
    /// Builds an all-free bitmap for `total_clusters` clusters.
    pub fn new_empty(total_clusters: u64) -> Self {
        let words = total_clusters.div_ceil(64) as usize;
        Self {
            bits: vec![0u64; words],
            total_clusters,
            fragmented_mode: false,
            probe: AllocatorProbe::default(),
        }
    }

    /// Parses the raw bytes of the `$Bitmap` attribute: one bit per cluster,
    /// LSB first within each byte, `1` meaning present/allocated.
    pub fn from_bitmap_bytes(data: &[u8], total_clusters: u64) -> Result<Self> {
        let required = total_clusters.div_ceil(8) as usize;
        if data.len() < required {
            return Err(Error::Truncated(ctx!("ntfs", "$Bitmap shorter than volume cluster count")));
        }
        let words = total_clusters.div_ceil(64) as usize;
        let mut bits = vec![0u64; words];
        for cluster in 0..total_clusters {
            let byte = data[(cluster / 8) as usize];
            if byte & (1 << (cluster % 8)) != 0 {
                bits[(cluster / 64) as usize] |= 1 << (cluster % 64);
            }
        }
        Ok(Self {
            bits,
            total_clusters,
            fragmented_mode: false,
            probe: AllocatorProbe::default(),
        })
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_clusters
    }

    pub fn fragmented_mode(&self) -> bool {
        self.fragmented_mode
    }

    pub fn probe(&self) -> &AllocatorProbe {
        &self.probe
    }

    pub fn present(&self, cluster: u64) -> bool {
        if cluster >= self.total_clusters {
            return true;
        }
        self.bits[(cluster / 64) as usize] & (1 << (cluster % 64)) != 0
    }

    fn set(&mut self, cluster: u64, present: bool) {
        let word = &mut self.bits[(cluster / 64) as usize];
        if present {
            *word |= 1 << (cluster % 64);
        } else {
            *word &= !(1 << (cluster % 64));
        }
    }

    /// Length of the free run starting exactly at `start`, capped at `max_len`.
    fn free_run_at(&self, start: u64, max_len: u64) -> u64 {
        let mut len = 0;
        while len < max_len && start + len < self.total_clusters && !self.present(start + len) {
            len += 1;
        }
        len
    }

    /// Best-effort scatter-gather: walks the whole bitmap once collecting
    /// every free run until `remaining` clusters are covered.
    fn gather_scattered(&self, remaining: u64) -> Vec<ClusterRun> {
        let mut runs = Vec::new();
        let mut still_needed = remaining;
        let mut cursor = 0u64;
        while cursor < self.total_clusters && still_needed > 0 {
            if self.present(cursor) {
                cursor += 1;
                continue;
            }
            let len = self.free_run_at(cursor, still_needed);
            if len == 0 {
                cursor += 1;
                continue;
            }
            runs.push(ClusterRun { offset: cursor, length: len });
            still_needed = still_needed.saturating_sub(len);
            cursor += len;
        }
        runs
    }

    /// Searches windows of the disk, largest first, for one run at least
    /// `needed` clusters long. Returns the run on success.
    fn find_contiguous(&self, needed: u64) -> Option<ClusterRun> {
        self.probe.contiguous_pass_attempts.set(self.probe.contiguous_pass_attempts.get() + 1);
        for divisor in WINDOW_DIVISORS {
            let window = (self.total_clusters / divisor).max(needed);
            let mut cursor = 0u64;
            while cursor < self.total_clusters {
                let window_end = (cursor + window).min(self.total_clusters);
                let mut inner = cursor;
                while inner < window_end {
                    if self.present(inner) {
                        inner += 1;
                        continue;
                    }
                    let len = self.free_run_at(inner, needed);
                    if len >= needed {
                        return Some(ClusterRun { offset: inner, length: needed });
                    }
                    inner += len.max(1);
                }
                cursor += window;
            }
        }
        None
    }

    fn mark_runs(&mut self, runs: &[ClusterRun], present: bool) {
        for run in runs {
            for cluster in run.offset..run.offset + run.length {
                self.set(cluster, present);
            }
        }
    }

    /// Allocates `count` clusters, per §4.5.2's fail-safe fragmentation-aware
    /// strategy:
    ///
    /// 1. try to extend a run starting exactly at `proposed_start`;
    /// 2. otherwise search windows of the disk, largest first, for one
    ///    contiguous run (skipped entirely while `fragmented_mode` is latched);
    /// 3. otherwise scatter-gather whatever free runs exist;
    /// 4. if the total found is still short, free everything this call
    ///    allocated and fail with `OutOfSpace`.
    pub fn allocate(&mut self, count: u64, proposed_start: Option<u64>) -> Result<Vec<ClusterRun>> {
        self.allocate_cancellable(count, proposed_start, || false)
    }

    /// As [`Self::allocate`], but `cancelled` is polled between strategies;
    /// a `true` result rolls back any runs already marked present and
    /// returns `Error::Cancelled` (§5).
    pub fn allocate_cancellable(
        &mut self,
        count: u64,
        proposed_start: Option<u64>,
        cancelled: impl Fn() -> bool,
    ) -> Result<Vec<ClusterRun>> {
        let mut runs: Vec<ClusterRun> = Vec::new();
        let mut remaining = count;

        if let Some(start) = proposed_start {
            let len = self.free_run_at(start, remaining);
            if len > 0 {
                runs.push(ClusterRun { offset: start, length: len });
                remaining -= len;
            }
        }

        if cancelled() {
            self.mark_runs(&runs, false);
            return Err(Error::Cancelled(ctx!("ntfs", "cluster allocation cancelled")));
        }

        if remaining > 0 && !self.fragmented_mode {
            if let Some(run) = self.find_contiguous(remaining) {
                runs.push(run);
                remaining = 0;
            }
        }

        if cancelled() {
            self.mark_runs(&runs, false);
            return Err(Error::Cancelled(ctx!("ntfs", "cluster allocation cancelled")));
        }

        if remaining > 0 {
            // Mark what we already claimed present so the scatter-gather
            // pass doesn't hand the same clusters back out twice.
            self.mark_runs(&runs, true);
            let scattered = self.gather_scattered(remaining);
            let scattered_total: u64 = scattered.iter().map(|r| r.length).sum();
            if scattered_total < remaining {
                self.mark_runs(&runs, false);
                return Err(Error::OutOfSpace(ctx!(
                    "ntfs",
                    "only {} of {} requested clusters available",
                    scattered_total + (count - remaining),
                    count
                )));
            }
            self.mark_runs(&scattered, true);
            runs.extend(scattered);
        } else {
            self.mark_runs(&runs, true);
        }

        self.fragmented_mode = !(runs.len() == 1 && runs[0].length >= 4);

        Ok(runs)
    }

    /// Frees every cluster covered by `runs`.
    pub fn free(&mut self, runs: &[ClusterRun]) {
        self.mark_runs(runs, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_single_contiguous_run_resets_fragmented_mode() {
        let mut bitmap = ClusterBitmap::new_empty(1000);
        let runs = bitmap.allocate(100, None).unwrap();
        assert_eq!(runs.iter().map(|r| r.length).sum::<u64>(), 100);
        assert!(!bitmap.fragmented_mode());
    }

    #[test]
    fn allocation_never_returns_an_already_present_cluster() {
        let mut bitmap = ClusterBitmap::new_empty(64);
        let first = bitmap.allocate(20, None).unwrap();
        let second = bitmap.allocate(20, None).unwrap();
        let first_set: std::collections::HashSet<u64> =
            first.iter().flat_map(|r| r.offset..r.offset + r.length).collect();
        for run in &second {
            for cluster in run.offset..run.offset + run.length {
                assert!(!first_set.contains(&cluster));
            }
        }
    }

    #[test]
    fn free_then_present_is_false_everywhere() {
        let mut bitmap = ClusterBitmap::new_empty(64);
        let runs = bitmap.allocate(10, None).unwrap();
        bitmap.free(&runs);
        for run in &runs {
            for cluster in run.offset..run.offset + run.length {
                assert!(!bitmap.present(cluster));
            }
        }
    }

    #[test]
    fn out_of_space_rolls_back_everything_allocated_this_call() {
        let mut bitmap = ClusterBitmap::new_empty(50);
        bitmap.allocate(40, None).unwrap();
        let err = bitmap.allocate(20, None);
        assert!(matches!(err, Err(Error::OutOfSpace(_))));
        // The failed call must not have left any extra clusters marked present.
        let mut free_count = 0;
        for c in 0..50 {
            if !bitmap.present(c) {
                free_count += 1;
            }
        }
        assert_eq!(free_count, 10);
    }

    #[test]
    fn fragmentation_latch_skips_contiguous_pass_until_reset() {
        // Largest free run is 30 clusters out of 100; a 100-cluster request
        // must split across multiple runs and latch fragmented_mode.
        let mut bitmap = ClusterBitmap::new_empty(100);
        // Carve the free space into runs no longer than 30 clusters by
        // allocating a 1-cluster blocker every 30 clusters.
        for c in (29..100).step_by(30) {
            bitmap.allocate(1, Some(c)).unwrap();
        }

        let attempts_before = bitmap.probe().contiguous_pass_attempts();
        let first = bitmap.allocate(60, None).unwrap();
        assert_eq!(first.iter().map(|r| r.length).sum::<u64>(), 60);
        assert!(first.len() > 1);
        assert!(bitmap.fragmented_mode());
        assert!(bitmap.probe().contiguous_pass_attempts() > attempts_before);

        let attempts_mid = bitmap.probe().contiguous_pass_attempts();
        let _ = bitmap.allocate(10, None);
        assert_eq!(
            bitmap.probe().contiguous_pass_attempts(),
            attempts_mid,
            "contiguous-range pass must be skipped while fragmented_mode is latched"
        );
    }

    #[test]
    fn cancellation_rolls_back_partial_allocation() {
        let mut bitmap = ClusterBitmap::new_empty(100);
        let err = bitmap.allocate_cancellable(50, None, || true);
        assert!(matches!(err, Err(Error::Cancelled(_))));
        for c in 0..100 {
            assert!(!bitmap.present(c));
        }
    }

    #[test]
    fn bitmap_bytes_round_trip_present_bits() {
        // Cluster 0 and 9 present, LSB-first within each byte.
        let bytes = [0b0000_0001u8, 0b0000_0010];
        let bitmap = ClusterBitmap::from_bitmap_bytes(&bytes, 16).unwrap();
        assert!(bitmap.present(0));
        assert!(!bitmap.present(1));
        assert!(bitmap.present(9));
        assert!(!bitmap.present(8));
    }
}
