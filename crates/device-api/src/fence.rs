// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Sync fences: handles signaled when a deferred computation completes.
//!
//! A [`SyncFence`] is the in-process rendition of a fence file
//! descriptor: cloneable, waitable with a timeout, pollable without
//! blocking, and signaled exactly once by the producing driver — either
//! successfully or with an error.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Observable state of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Not yet signaled.
    Active,
    /// Signaled: the computation completed successfully.
    Signaled,
    /// Signaled with an error.
    Error,
}

struct FenceInner {
    state: Mutex<FenceState>,
    cond: Condvar,
}

/// A cloneable completion fence.
#[derive(Clone)]
pub struct SyncFence {
    inner: Arc<FenceInner>,
}

impl SyncFence {
    /// Creates an unsignaled fence.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                state: Mutex::new(FenceState::Active),
                cond: Condvar::new(),
            }),
        }
    }

    /// Creates a fence that is already signaled successfully.
    pub fn signaled() -> Self {
        let fence = Self::new();
        fence.signal(true);
        fence
    }

    /// Signals the fence. The first signal wins; later calls are ignored.
    pub fn signal(&self, success: bool) {
        let mut state = lock(&self.inner.state);
        if *state == FenceState::Active {
            *state = if success { FenceState::Signaled } else { FenceState::Error };
            self.inner.cond.notify_all();
        }
    }

    /// Returns the current state without blocking (a zero-timeout wait).
    pub fn poll(&self) -> FenceState {
        *lock(&self.inner.state)
    }

    /// Waits for the fence to leave `Active`.
    ///
    /// With `timeout == None` the wait is unbounded. Returns the state
    /// observed when the wait ended — still `Active` if it timed out.
    pub fn wait(&self, timeout: Option<Duration>) -> FenceState {
        let mut state = lock(&self.inner.state);
        match timeout {
            None => {
                while *state == FenceState::Active {
                    state = match self.inner.cond.wait(state) {
                        Ok(s) => s,
                        Err(p) => p.into_inner(),
                    };
                }
                *state
            }
            Some(timeout) => {
                let (state, _timed_out) = match self
                    .inner
                    .cond
                    .wait_timeout_while(state, timeout, |s| *s == FenceState::Active)
                {
                    Ok(r) => r,
                    Err(p) => p.into_inner(),
                };
                *state
            }
        }
    }
}

impl SyncFence {
    /// Returns `true` if the two handles are the same fence.
    pub fn ptr_eq(&self, other: &SyncFence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for SyncFence {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SyncFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncFence").field("state", &self.poll()).finish()
    }
}

fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}
