// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The per-execution cursor over a compiled plan.
//!
//! One [`Controller`] is created per execution and ticked by the
//! engine. `next` yields steps in plan order and checks the overall
//! deadline between steps; `fallback` re-emits the previously yielded
//! step so it can be retried after the dynamic-temporary table has been
//! widened (or re-run on the CPU). Deadline misses reported here are
//! authoritative: the engine must not respond with CPU fallback.

use crate::{Compilation, ExecutionStep};
use device_api::{Burst, ErrorCode};
use std::sync::Arc;
use std::time::Instant;

/// What one controller tick produced.
pub enum Tick {
    /// The next (or re-emitted) step. Consume it before ticking again.
    Step(Arc<ExecutionStep>),
    /// End of plan: every step completed.
    Done,
}

/// Cursor state for one execution of one plan.
pub struct Controller {
    compilation: Arc<Compilation>,
    /// Index of the next step `next` will yield.
    cursor: usize,
    /// Step most recently yielded, for `fallback`.
    last: Option<usize>,
    /// Burst sessions opened so far, index-aligned with plan steps.
    bursts: Vec<Option<Arc<dyn Burst>>>,
}

impl Controller {
    pub(crate) fn new(compilation: Arc<Compilation>) -> Self {
        let steps = compilation.plan().steps().len();
        Self {
            compilation,
            cursor: 0,
            last: None,
            bursts: vec![None; steps],
        }
    }

    /// The compilation this controller walks.
    pub fn compilation(&self) -> &Arc<Compilation> {
        &self.compilation
    }

    /// Yields the next step, or `Done` at end of plan.
    ///
    /// Checks the overall deadline between steps; an expired deadline
    /// surfaces as `MISSED_DEADLINE_TRANSIENT` from here rather than
    /// from a driver.
    pub fn next(&mut self, deadline: Option<Instant>) -> Result<Tick, ErrorCode> {
        self.check_deadline(deadline)?;
        let steps = self.compilation.plan().steps();
        if self.cursor >= steps.len() {
            tracing::debug!("controller: end of plan");
            return Ok(Tick::Done);
        }
        let step = Arc::clone(&steps[self.cursor]);
        tracing::debug!(step = step.index, device = step.device.name(), "controller: next");
        self.last = Some(self.cursor);
        self.cursor += 1;
        Ok(Tick::Step(step))
    }

    /// Re-emits the previously yielded step.
    ///
    /// The engine re-materialises the step's bindings against the
    /// updated temporary table when it builds the retry executor, so
    /// grown temporaries are absorbed by construction.
    pub fn fallback(&mut self, deadline: Option<Instant>) -> Result<Tick, ErrorCode> {
        self.check_deadline(deadline)?;
        let Some(last) = self.last else {
            // Nothing was yielded yet; only a mis-sequenced engine gets here.
            return Err(ErrorCode::OpFailed);
        };
        let step = Arc::clone(&self.compilation.plan().steps()[last]);
        tracing::debug!(step = step.index, "controller: fallback re-emit");
        Ok(Tick::Step(step))
    }

    /// Returns the burst session for `step`, opening it on first use.
    ///
    /// Steps sharing a device share a session.
    pub fn burst_for(&mut self, step: &ExecutionStep) -> Option<Arc<dyn Burst>> {
        if let Some(burst) = &self.bursts[step.index] {
            return Some(Arc::clone(burst));
        }
        // Reuse a session opened for an earlier step on the same device.
        let steps = self.compilation.plan().steps();
        for (i, other) in steps.iter().enumerate() {
            if i != step.index
                && Arc::ptr_eq(&other.device, &step.device)
                && self.bursts[i].is_some()
            {
                let burst = self.bursts[i].clone();
                self.bursts[step.index] = burst.clone();
                return burst;
            }
        }
        let burst = step.device.open_burst();
        self.bursts[step.index] = burst.clone();
        burst
    }

    fn check_deadline(&self, deadline: Option<Instant>) -> Result<(), ErrorCode> {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                tracing::debug!("controller: overall deadline expired");
                return Err(ErrorCode::MissedDeadlineTransient);
            }
        }
        Ok(())
    }
}
