// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Terminal-state publication.
//!
//! An execution ends in exactly one of two ways:
//!
//! - **without fence** — the step loop publishes an
//!   [`EngineCompletion`] record: status, final output shapes, timing.
//! - **with fence** — fenced end-of-plan publishes the terminal sync
//!   fence plus the last step's callback; completion is observed by
//!   polling the fence.
//!
//! Either way the record is published exactly once, under a single
//! happens-before edge that `wait` observes.

use device_api::{ErrorCode, FencedCallback, OutputShape, SyncFence, Timing};
use std::sync::{Arc, Condvar, Mutex};

/// How the execution reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedMode {
    WithoutFence,
    WithFence,
}

/// Query-level classification of a finished execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    NoError,
    OutputInsufficientSize,
    OtherError,
}

/// Selector for [`crate::ExecutionEngine::duration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationCode {
    /// Time on the accelerator, launched execution.
    OnHardware,
    /// Time in the driver, launched execution.
    InDriver,
    /// Time on the accelerator, measured after the last wait fence.
    FencedOnHardware,
    /// Time in the driver, measured after the last wait fence.
    FencedInDriver,
}

/// The terminal record of a fence-less execution.
#[derive(Debug, Clone)]
pub struct EngineCompletion {
    pub status: ErrorCode,
    pub output_shapes: Vec<OutputShape>,
    pub timing: Timing,
    pub mode: CompletedMode,
}

pub(crate) enum TerminalState {
    Pending,
    WithoutFence(EngineCompletion),
    WithFence {
        fence: SyncFence,
        callback: Option<Arc<dyn FencedCallback>>,
        output_shapes: Vec<OutputShape>,
    },
}

/// Publish-once cell with a happens-before edge for waiters.
pub(crate) struct CompletionCell {
    state: Mutex<TerminalState>,
    cond: Condvar,
}

impl CompletionCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TerminalState::Pending),
            cond: Condvar::new(),
        }
    }

    /// Publishes the fence-less terminal record. Panics on a second
    /// publication; that is an engine bug, not a recoverable state.
    pub fn publish_without_fence(&self, completion: EngineCompletion) {
        let mut state = lock(&self.state);
        assert!(
            matches!(*state, TerminalState::Pending),
            "terminal record published twice"
        );
        *state = TerminalState::WithoutFence(completion);
        self.cond.notify_all();
    }

    /// Publishes the fenced terminal record.
    pub fn publish_with_fence(
        &self,
        fence: SyncFence,
        callback: Option<Arc<dyn FencedCallback>>,
        output_shapes: Vec<OutputShape>,
    ) {
        let mut state = lock(&self.state);
        assert!(
            matches!(*state, TerminalState::Pending),
            "terminal record published twice"
        );
        *state = TerminalState::WithFence {
            fence,
            callback,
            output_shapes,
        };
        self.cond.notify_all();
    }

    /// Blocks until a fence-less record lands and returns it. Only
    /// background executions wait here, and those never publish a
    /// fence.
    pub fn wait_without_fence(&self) -> EngineCompletion {
        let mut state = lock(&self.state);
        loop {
            match &*state {
                TerminalState::WithoutFence(completion) => return completion.clone(),
                TerminalState::WithFence { .. } => {
                    unreachable!("background execution published a fence")
                }
                TerminalState::Pending => {
                    state = match self.cond.wait(state) {
                        Ok(s) => s,
                        Err(p) => p.into_inner(),
                    };
                }
            }
        }
    }

    /// Runs `f` over the current terminal state.
    pub fn with<R>(&self, f: impl FnOnce(&TerminalState) -> R) -> R {
        f(&lock(&self.state))
    }
}

fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn completion(status: ErrorCode) -> EngineCompletion {
        EngineCompletion {
            status,
            output_shapes: Vec::new(),
            timing: Timing::unavailable(),
            mode: CompletedMode::WithoutFence,
        }
    }

    #[test]
    fn test_publish_and_read() {
        let cell = CompletionCell::new();
        assert!(cell.with(|s| matches!(s, TerminalState::Pending)));
        cell.publish_without_fence(completion(ErrorCode::NoError));
        cell.with(|s| match s {
            TerminalState::WithoutFence(c) => assert_eq!(c.status, ErrorCode::NoError),
            _ => panic!("expected published record"),
        });
    }

    #[test]
    #[should_panic(expected = "published twice")]
    fn test_double_publish_panics() {
        let cell = CompletionCell::new();
        cell.publish_without_fence(completion(ErrorCode::NoError));
        cell.publish_without_fence(completion(ErrorCode::OpFailed));
    }

    #[test]
    fn test_wait_observes_publication() {
        let cell = Arc::new(CompletionCell::new());
        let publisher = Arc::clone(&cell);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            publisher.publish_without_fence(completion(ErrorCode::OpFailed));
        });
        let seen = cell.wait_without_fence();
        assert_eq!(seen.status, ErrorCode::OpFailed);
        t.join().unwrap();
    }

    #[test]
    fn test_fenced_publication() {
        let cell = CompletionCell::new();
        cell.publish_with_fence(SyncFence::signaled(), None, Vec::new());
        assert!(cell.with(|s| matches!(s, TerminalState::WithFence { .. })));
    }
}
