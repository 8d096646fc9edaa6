// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Budget-enforced staging pool.
//!
//! The [`StagingPool`] allocates the host buffers an execution needs
//! beyond what the caller bound: dynamic temporaries passed between
//! steps, and shadow buffers that stand in for opaque device memory
//! during CPU fallback. It:
//!
//! 1. Enforces a hard staging ceiling — requests beyond the budget
//!    return `Err(OutOfMemory)` rather than growing without bound
//!    (a runaway shape-retry loop would otherwise do exactly that).
//! 2. Keeps a free list of returned buffers, binned by size class,
//!    because the insufficient-size retry path frees and re-stages the
//!    same temporary repeatedly.
//! 3. Tracks usage statistics.
//!
//! Buffers are always zero-filled when handed out; a recycled
//! temporary must not leak bytes from an earlier execution.
//!
//! # Thread Safety
//! `StagingPool` is `Send + Sync`; all interior mutability is behind
//! `Mutex` or atomics.

use crate::{MemoryBudget, MemoryError, PoolStats, StagingGuard};
use device_api::HostBuffer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Minimum size class: 256 bytes. Temporaries are often tiny.
const MIN_SIZE_CLASS: usize = 256;

/// Shared pool state; guards hold an `Arc` to it for returns.
pub struct PoolInner {
    budget: MemoryBudget,
    staged_bytes: AtomicUsize,
    free_buffers: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    stats: Mutex<PoolStats>,
}

impl PoolInner {
    /// Called by `StagingGuard::drop` to return storage.
    pub(crate) fn return_buffer(&self, buffer: HostBuffer, size_bytes: usize) {
        self.staged_bytes.fetch_sub(size_bytes, Ordering::Release);

        // Recycle only if the driver-side views are gone.
        let reclaimed = match buffer.try_into_vec() {
            Ok(vec) => {
                let size_class = size_class_for(size_bytes);
                if let Ok(mut free) = self.free_buffers.lock() {
                    free.entry(size_class).or_default().push(vec);
                }
                true
            }
            Err(_still_shared) => false,
        };

        if let Ok(mut stats) = self.stats.lock() {
            stats.record_return(reclaimed);
        }
    }
}

/// The staging allocator.
///
/// # Example
/// ```
/// use memory_manager::{MemoryBudget, StagingPool};
///
/// let pool = StagingPool::new(MemoryBudget::from_mb(1));
/// let guard = pool.stage(64).unwrap();
/// assert_eq!(pool.staged_bytes(), 64);
/// drop(guard);
/// assert_eq!(pool.staged_bytes(), 0);
/// ```
pub struct StagingPool {
    inner: Arc<PoolInner>,
}

impl StagingPool {
    /// Creates a pool with the given budget.
    pub fn new(budget: MemoryBudget) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                budget,
                staged_bytes: AtomicUsize::new(0),
                free_buffers: Mutex::new(HashMap::new()),
                stats: Mutex::new(PoolStats::default()),
            }),
        }
    }

    /// Stages a zero-filled buffer of `size_bytes`.
    ///
    /// Returns `Err(OutOfMemory)` if the request would exceed the
    /// budget. Recycles a free-listed buffer of the right size class
    /// when one is available.
    pub fn stage(&self, size_bytes: usize) -> Result<StagingGuard, MemoryError> {
        if size_bytes == 0 {
            return Err(MemoryError::ZeroSizedAllocation);
        }

        let current = self.inner.staged_bytes.load(Ordering::Acquire);
        let budget = self.inner.budget.as_bytes();
        if current + size_bytes > budget {
            if let Ok(mut stats) = self.inner.stats.lock() {
                stats.record_rejection();
            }
            return Err(MemoryError::OutOfMemory {
                requested_bytes: size_bytes,
                available_bytes: budget.saturating_sub(current),
                budget_bytes: budget,
            });
        }

        let size_class = size_class_for(size_bytes);
        let recycled = self
            .inner
            .free_buffers
            .lock()
            .ok()
            .and_then(|mut free| free.get_mut(&size_class).and_then(|bin| bin.pop()));

        let reused = recycled.is_some();
        let data = match recycled {
            Some(mut vec) => {
                // clear + resize zero-fills the whole handed-out range.
                vec.clear();
                vec.resize(size_bytes, 0);
                vec
            }
            None => vec![0u8; size_bytes],
        };

        self.inner.staged_bytes.fetch_add(size_bytes, Ordering::Release);

        if let Ok(mut stats) = self.inner.stats.lock() {
            if reused {
                stats.record_reuse();
            } else {
                stats.record_fresh();
            }
            let now = self.inner.staged_bytes.load(Ordering::Acquire);
            stats.update_peak(now);
        }

        Ok(StagingGuard::new(
            HostBuffer::from_vec(data),
            Arc::clone(&self.inner),
            size_bytes,
        ))
    }

    /// Bytes currently staged (live guards).
    pub fn staged_bytes(&self) -> usize {
        self.inner.staged_bytes.load(Ordering::Acquire)
    }

    /// The configured budget.
    pub fn budget(&self) -> MemoryBudget {
        self.inner.budget
    }

    /// Snapshot of the usage statistics.
    pub fn stats(&self) -> PoolStats {
        self.inner
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Drops all free-listed buffers.
    pub fn shrink(&self) {
        if let Ok(mut free) = self.inner.free_buffers.lock() {
            free.clear();
        }
    }
}

/// Smallest power of two that is ≥ `size` and ≥ `MIN_SIZE_CLASS`.
fn size_class_for(size: usize) -> usize {
    size.max(MIN_SIZE_CLASS).next_power_of_two()
}

impl std::fmt::Debug for StagingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingPool")
            .field("budget", &self.inner.budget)
            .field("staged_bytes", &self.staged_bytes())
            .finish()
    }
}
