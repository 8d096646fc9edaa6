// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The dynamic-temporary table.
//!
//! A dynamic temporary is an inter-step intermediate whose size is
//! learned at runtime from driver-reported shapes. The table records,
//! per source operand, the best known dimensions and byte length, and
//! materialises staging buffers on demand.
//!
//! Length is monotone non-decreasing across redeclarations and bounded
//! by [`LENGTH_OVERFLOW_SENTINEL`]; dimensions only ever refine along
//! the updatable-by partial order. Together these bound the number of
//! effective redeclarations per execution, which is what makes the
//! insufficient-size retry loop terminate.

use crate::EngineError;
use device_api::HostBuffer;
use execution_plan::{CompiledPlan, ExecutionStep, SourceOperandIndex};
use memory_manager::{StagingGuard, StagingPool};
use operand_core::{Dimensions, Operand};
use std::collections::HashMap;

/// Lengths must stay below 2^31 so the doubling estimate cannot
/// overflow the 32-bit wire representation.
pub const LENGTH_OVERFLOW_SENTINEL: u32 = 1 << 31;

/// Table entry for one dynamic temporary.
struct TemporaryEntry {
    operand: Operand,
    dimensions: Dimensions,
    length: u32,
    buffer: Option<StagingGuard>,
}

/// Keyed by `(source-model, operand)` pairs from the plan.
pub struct DynamicTemporaryTable {
    entries: HashMap<SourceOperandIndex, TemporaryEntry>,
}

impl DynamicTemporaryTable {
    /// Seeds the table from the plan's temporary declarations.
    pub fn from_plan(plan: &CompiledPlan) -> Self {
        let entries = plan
            .temporaries()
            .iter()
            .map(|decl| {
                (
                    decl.source,
                    TemporaryEntry {
                        operand: decl.operand.clone(),
                        dimensions: decl.operand.dimensions.clone(),
                        length: decl.initial_length,
                        buffer: None,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Returns `true` if the plan declared no temporaries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current `(dimensions, length)` estimate for `source`.
    pub fn lookup(&self, source: SourceOperandIndex) -> Option<(&Dimensions, u32)> {
        self.entries.get(&source).map(|e| (&e.dimensions, e.length))
    }

    /// The declared operand for `source`.
    pub fn operand(&self, source: SourceOperandIndex) -> Option<&Operand> {
        self.entries.get(&source).map(|e| &e.operand)
    }

    /// Widens the entry for `source`.
    ///
    /// `dimensions` must refine the recorded ones; a driver reporting
    /// conflicting extents is misbehaving and the violation surfaces as
    /// `OP_FAILED`. The stored length is monotone: a smaller incoming
    /// estimate refines the shape but never shrinks it. Returns `true`
    /// iff the dimensions strictly refined or the length strictly grew
    /// — dropping any stale backing buffer in the latter case.
    pub fn redeclare(
        &mut self,
        source: SourceOperandIndex,
        dimensions: &Dimensions,
        length: u32,
    ) -> Result<bool, EngineError> {
        let entry = self.entries.get_mut(&source).ok_or_else(|| {
            EngineError::OpFailed(format!("redeclare of undeclared temporary {source:?}"))
        })?;
        if !entry.dimensions.is_updatable_by(dimensions) {
            return Err(EngineError::OpFailed(format!(
                "temporary {source:?} redeclared with conflicting dimensions {dimensions}"
            )));
        }

        let dims_refined = &entry.dimensions != dimensions && !dimensions.is_empty();
        let length_grew = length > entry.length;
        if dims_refined {
            entry.dimensions = dimensions.clone();
        }
        if length_grew {
            entry.length = length;
            // The old backing is too small now.
            entry.buffer = None;
        }
        let changed = dims_refined || length_grew;
        if changed {
            tracing::debug!(
                ?source,
                %dimensions,
                length,
                "dynamic temporary redeclared"
            );
        }
        Ok(changed)
    }

    /// Materialises backing buffers for every temporary `step` touches.
    ///
    /// Zero-length temporaries get no backing; they travel as empty
    /// discovery slots.
    pub fn ensure_allocated(
        &mut self,
        step: &ExecutionStep,
        pool: &StagingPool,
    ) -> Result<(), EngineError> {
        for source in step.consumed_temporaries().chain(step.produced_temporaries()) {
            let Some(entry) = self.entries.get_mut(&source) else {
                continue;
            };
            if entry.length == 0 {
                continue;
            }
            let needs = match &entry.buffer {
                Some(guard) => guard.size_bytes() != entry.length as usize,
                None => true,
            };
            if needs {
                entry.buffer = Some(pool.stage(entry.length as usize)?);
            }
        }
        Ok(())
    }

    /// Whether every temporary consumed by `step` has a finalized
    /// allocation matching its current length.
    pub fn allocated(&self, step: &ExecutionStep) -> bool {
        step.consumed_temporaries().all(|source| {
            match self.entries.get(&source) {
                None => true,
                Some(entry) if entry.length == 0 => true,
                Some(entry) => entry
                    .buffer
                    .as_ref()
                    .map(|g| g.size_bytes() == entry.length as usize)
                    .unwrap_or(false),
            }
        })
    }

    /// Shared view of the backing buffer for `source`, if staged.
    pub fn buffer(&self, source: SourceOperandIndex) -> Option<HostBuffer> {
        self.entries
            .get(&source)
            .and_then(|e| e.buffer.as_ref())
            .map(|g| g.buffer())
    }
}
