// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Staging pool statistics.
//!
//! [`PoolStats`] tracks how a [`crate::StagingPool`] is being used.
//! Dynamic-temporary retries allocate, grow, and re-allocate staging
//! buffers in a loop, so the reuse ratio is the signal for whether the
//! free list is doing its job.

/// Cumulative statistics about staging pool usage.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    /// Total number of staging requests.
    pub total_allocations: u64,
    /// Requests served from the free list.
    pub reuse_hits: u64,
    /// Requests that required fresh memory.
    pub fresh_allocations: u64,
    /// Requests rejected because the budget was exhausted.
    pub rejected_count: u64,
    /// Peak bytes staged at one time.
    pub peak_staged_bytes: usize,
    /// Buffers returned to the pool.
    pub total_returns: u64,
    /// Returned buffers that could not be recycled because a driver
    /// still held a view of them.
    pub unreclaimed_returns: u64,
}

impl PoolStats {
    /// Returns the free-list reuse ratio in `[0.0, 1.0]`.
    pub fn reuse_ratio(&self) -> f64 {
        let total = self.reuse_hits + self.fresh_allocations;
        if total == 0 {
            return 0.0;
        }
        self.reuse_hits as f64 / total as f64
    }

    pub(crate) fn record_reuse(&mut self) {
        self.total_allocations += 1;
        self.reuse_hits += 1;
    }

    pub(crate) fn record_fresh(&mut self) {
        self.total_allocations += 1;
        self.fresh_allocations += 1;
    }

    pub(crate) fn record_rejection(&mut self) {
        self.total_allocations += 1;
        self.rejected_count += 1;
    }

    pub(crate) fn record_return(&mut self, reclaimed: bool) {
        self.total_returns += 1;
        if !reclaimed {
            self.unreclaimed_returns += 1;
        }
    }

    pub(crate) fn update_peak(&mut self, current_bytes: usize) {
        if current_bytes > self.peak_staged_bytes {
            self.peak_staged_bytes = current_bytes;
        }
    }

    /// Returns a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "Staging: {} requests ({} reused, {} fresh, {:.0}% reuse), \
             {} rejected, peak {} bytes, {} returns ({} unreclaimed)",
            self.total_allocations,
            self.reuse_hits,
            self.fresh_allocations,
            self.reuse_ratio() * 100.0,
            self.rejected_count,
            self.peak_staged_bytes,
            self.total_returns,
            self.unreclaimed_returns,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let s = PoolStats::default();
        assert_eq!(s.total_allocations, 0);
        assert_eq!(s.reuse_ratio(), 0.0);
    }

    #[test]
    fn test_reuse_ratio() {
        let mut s = PoolStats::default();
        s.record_reuse();
        s.record_reuse();
        s.record_fresh();
        assert!((s.reuse_ratio() - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_peak_does_not_decrease() {
        let mut s = PoolStats::default();
        s.update_peak(100);
        s.update_peak(50);
        assert_eq!(s.peak_staged_bytes, 100);
    }

    #[test]
    fn test_summary() {
        let mut s = PoolStats::default();
        s.record_fresh();
        s.record_reuse();
        let summary = s.summary();
        assert!(summary.contains("2 requests"));
        assert!(summary.contains("1 reused"));
    }
}
