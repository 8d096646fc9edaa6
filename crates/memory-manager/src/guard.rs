// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! RAII staging guard.
//!
//! A [`StagingGuard`] owns one staged buffer for as long as the
//! execution needs it — the lifetime of a dynamic temporary between
//! its producing and consuming steps, or of a shadow buffer across a
//! CPU-fallback call. Dropping the guard returns the storage to the
//! pool's free list, provided no driver still holds a view of it.

use crate::pool::PoolInner;
use device_api::HostBuffer;
use std::sync::Arc;

/// An RAII guard over a staged [`HostBuffer`].
///
/// The guard hands out shared views via [`StagingGuard::buffer`] so the
/// buffer can appear in driver requests; the guard itself stays with
/// the execution and controls when the storage goes back to the pool.
pub struct StagingGuard {
    /// Wrapped in `Option` so `drop` can take it back.
    buffer: Option<HostBuffer>,
    pool: Arc<PoolInner>,
    size_bytes: usize,
}

impl StagingGuard {
    pub(crate) fn new(buffer: HostBuffer, pool: Arc<PoolInner>, size_bytes: usize) -> Self {
        Self {
            buffer: Some(buffer),
            pool,
            size_bytes,
        }
    }

    /// Returns a shared view of the staged buffer.
    pub fn buffer(&self) -> HostBuffer {
        self.buffer
            .as_ref()
            .expect("staging buffer already returned")
            .clone()
    }

    /// Size of this staging allocation in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.return_buffer(buffer, self.size_bytes);
        }
    }
}

impl std::fmt::Debug for StagingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingGuard")
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}
