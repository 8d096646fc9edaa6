// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The memory-pool interface consumed from memory-region providers.
//!
//! Pools are shared-read across the engine and drivers. The engine
//! never interprets a pool's contents; it validates bindings against
//! the pool's [`MemoryValidator`], substitutes host shadows for opaque
//! device pools during CPU fallback, and marks output pools initialized
//! at publication.

use crate::{ErrorCode, HostBuffer};
use operand_core::Dimensions;
use std::sync::Mutex;

/// Whether an access binds the pool as an execution input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Input,
    Output,
}

/// Validation and metadata surface of a memory pool.
pub trait MemoryValidator: Send + Sync {
    /// Validates a binding of `[offset, offset+length)` for `io`/`index`,
    /// with an optional caller dimension override.
    fn validate(
        &self,
        io: IoKind,
        index: u32,
        override_dims: Option<&Dimensions>,
        offset: usize,
        length: usize,
    ) -> bool;

    /// Validates that an input pool's recorded shape agrees with the
    /// dimensions the binding settled on.
    fn validate_input_dimensions(&self, dims: &Dimensions) -> bool;

    /// Records the final dimensions of an output pool. Returns `false`
    /// if they contradict previously recorded metadata.
    fn update_metadata(&self, dims: &Dimensions) -> bool;

    /// Marks whether the pool now holds initialized output data.
    fn set_initialized(&self, initialized: bool);

    /// Returns `true` if the pool was created without a known shape.
    fn created_with_unknown_shape(&self) -> bool;

    /// Returns `true` if `offset == 0 && length == 0` means "the entire
    /// region" for this pool.
    fn supports_whole_region(&self) -> bool;
}

/// Opaque device-resident storage behind a pool.
pub trait DeviceBuffer: Send + Sync {
    /// Copies the device contents into `dst`.
    fn copy_to_host(&self, dst: &HostBuffer) -> Result<(), ErrorCode>;

    /// Copies `src` into the device storage.
    fn copy_from_host(&self, src: &HostBuffer) -> Result<(), ErrorCode>;
}

/// A memory region referenced by bindings and handed to drivers.
pub trait PoolMemory: Send + Sync {
    /// Size of the region in bytes.
    fn logical_size(&self) -> usize;

    /// Host view of the region, if it is host-visible.
    fn host_memory(&self) -> Option<HostBuffer>;

    /// Device-resident storage, if the region is opaque device memory.
    fn device_buffer(&self) -> Option<&dyn DeviceBuffer>;

    /// The pool's validator.
    fn validator(&self) -> &dyn MemoryValidator;
}

// ── Host-backed pool ───────────────────────────────────────────

#[derive(Debug)]
struct HostPoolMeta {
    dimensions: Dimensions,
    initialized: bool,
}

/// A plain host-visible pool.
///
/// This is the region type the engine itself allocates (CPU-fallback
/// shadow buffers) and the workhorse of the test suites. Its validator
/// accepts any in-bounds range and tracks shape metadata and the
/// initialized flag.
pub struct HostPoolMemory {
    buffer: HostBuffer,
    meta: Mutex<HostPoolMeta>,
    unknown_shape: bool,
    whole_region: bool,
}

impl HostPoolMemory {
    /// A pool of `size` zeroed bytes with no shape metadata.
    pub fn new(size: usize) -> Self {
        Self::build(size, Dimensions::unspecified(), false)
    }

    /// A pool with recorded shape metadata.
    pub fn with_dimensions(size: usize, dimensions: Dimensions) -> Self {
        Self::build(size, dimensions, false)
    }

    /// A pool whose shape was unknown at creation. CPU fallback cannot
    /// size an output shadow for such a pool.
    pub fn with_unknown_shape(size: usize) -> Self {
        Self::build(size, Dimensions::unspecified(), true)
    }

    fn build(size: usize, dimensions: Dimensions, unknown_shape: bool) -> Self {
        Self {
            buffer: HostBuffer::new_zeroed(size),
            meta: Mutex::new(HostPoolMeta {
                dimensions,
                initialized: false,
            }),
            unknown_shape,
            whole_region: true,
        }
    }

    /// Disables the `offset == 0 && length == 0` whole-region convention.
    pub fn without_whole_region(mut self) -> Self {
        self.whole_region = false;
        self
    }

    /// Direct handle to the backing host buffer.
    pub fn buffer(&self) -> HostBuffer {
        self.buffer.clone()
    }

    /// Returns `true` once the pool has been marked initialized.
    pub fn is_initialized(&self) -> bool {
        lock_meta(&self.meta).initialized
    }

    /// The dimensions recorded by `update_metadata`.
    pub fn recorded_dimensions(&self) -> Dimensions {
        lock_meta(&self.meta).dimensions.clone()
    }
}

fn lock_meta(m: &Mutex<HostPoolMeta>) -> std::sync::MutexGuard<'_, HostPoolMeta> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

impl MemoryValidator for HostPoolMemory {
    fn validate(
        &self,
        _io: IoKind,
        _index: u32,
        _override_dims: Option<&Dimensions>,
        offset: usize,
        length: usize,
    ) -> bool {
        if offset == 0 && length == 0 {
            return self.whole_region;
        }
        offset
            .checked_add(length)
            .map(|end| end <= self.buffer.len())
            .unwrap_or(false)
    }

    fn validate_input_dimensions(&self, dims: &Dimensions) -> bool {
        lock_meta(&self.meta).dimensions.is_updatable_by(dims)
    }

    fn update_metadata(&self, dims: &Dimensions) -> bool {
        let mut meta = lock_meta(&self.meta);
        if !meta.dimensions.is_updatable_by(dims) {
            return false;
        }
        if !dims.is_empty() {
            meta.dimensions = dims.clone();
        }
        true
    }

    fn set_initialized(&self, initialized: bool) {
        lock_meta(&self.meta).initialized = initialized;
    }

    fn created_with_unknown_shape(&self) -> bool {
        self.unknown_shape
    }

    fn supports_whole_region(&self) -> bool {
        self.whole_region
    }
}

impl PoolMemory for HostPoolMemory {
    fn logical_size(&self) -> usize {
        self.buffer.len()
    }

    fn host_memory(&self) -> Option<HostBuffer> {
        Some(self.buffer.clone())
    }

    fn device_buffer(&self) -> Option<&dyn DeviceBuffer> {
        None
    }

    fn validator(&self) -> &dyn MemoryValidator {
        self
    }
}
