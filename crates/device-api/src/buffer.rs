// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Shared host byte buffers.
//!
//! A [`HostBuffer`] is the engine's rendition of "pointer + length": a
//! cheaply cloneable handle onto caller- or pool-owned host memory that
//! both the engine and a driver call can view. Interior mutability is
//! behind an `RwLock`; per the runtime's sharing policy, writes happen
//! only inside driver calls or fallback copy phases, never concurrently
//! with reads of the same execution.

use std::sync::{Arc, RwLock};

/// A shared, fixed-length host byte buffer.
#[derive(Clone)]
pub struct HostBuffer {
    inner: Arc<RwLock<Vec<u8>>>,
}

impl HostBuffer {
    /// Allocates a zero-filled buffer of `len` bytes.
    pub fn new_zeroed(len: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(vec![0u8; len])),
        }
    }

    /// Wraps an existing byte vector.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(data)),
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(g) => g.len(),
            Err(p) => p.into_inner().len(),
        }
    }

    /// Returns `true` if the buffer has zero length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` over an immutable view of the bytes.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self.inner.read() {
            Ok(g) => f(&g),
            Err(p) => f(&p.into_inner()),
        }
    }

    /// Runs `f` over a mutable view of the bytes.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match self.inner.write() {
            Ok(mut g) => f(&mut g),
            Err(p) => f(&mut p.into_inner()),
        }
    }

    /// Copies `src` into the front of the buffer.
    ///
    /// Returns `false` (and copies nothing) if `src` is longer than
    /// this buffer.
    pub fn copy_from_slice(&self, src: &[u8]) -> bool {
        self.write(|bytes| {
            if src.len() > bytes.len() {
                return false;
            }
            bytes[..src.len()].copy_from_slice(src);
            true
        })
    }

    /// Copies the contents out into a fresh vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.read(|bytes| bytes.to_vec())
    }

    /// Returns `true` if the two handles view the same allocation.
    pub fn ptr_eq(&self, other: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Reclaims the underlying vector if this is the last handle.
    ///
    /// Pools use this to recycle storage; if a driver still holds a
    /// clone, the handle is returned unchanged and the storage is
    /// simply dropped when the last clone goes away.
    pub fn try_into_vec(self) -> Result<Vec<u8>, HostBuffer> {
        match Arc::try_unwrap(self.inner) {
            Ok(lock) => Ok(match lock.into_inner() {
                Ok(v) => v,
                Err(p) => p.into_inner(),
            }),
            Err(inner) => Err(HostBuffer { inner }),
        }
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}
