// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! One partition of a compiled plan.
//!
//! An [`ExecutionStep`] is the unit of execution, retry, and fallback:
//! one step model, prepared for one device, with its inputs and
//! outputs described as references into either the main model's
//! binding table or the dynamic-temporary table.

use device_api::{Device, PreparedModel};
use operand_core::ModelSpec;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Identifies an operand of one source model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceOperandIndex {
    pub model: u32,
    pub operand: u32,
}

/// Where a step input/output gets its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOperand {
    /// Index into the main model's input list (step inputs) or output
    /// list (step outputs).
    Main(u32),
    /// A dynamic temporary carried between steps.
    Temporary(SourceOperandIndex),
}

/// One partition, frozen at compile time.
pub struct ExecutionStep {
    /// Position of this step in the plan's total order.
    pub index: usize,
    /// Which source model this step was carved from.
    pub source_model: u32,
    /// The step model the prepared artifact executes.
    pub step_model: Arc<ModelSpec>,
    /// The device this step was assigned to.
    pub device: Arc<dyn Device>,
    /// The driver artifact prepared at compile time.
    pub prepared_model: Arc<dyn PreparedModel>,
    /// Sources for each step-model input, in declaration order.
    pub inputs: Vec<StepOperand>,
    /// Destinations for each step-model output, in declaration order.
    pub outputs: Vec<StepOperand>,
    /// Main-model output indices written by this step that are also
    /// read by a later step.
    pub downstream_main_outputs: BTreeSet<u32>,
}

impl ExecutionStep {
    /// Maps step-output `i` back to a main-model output index, if it is
    /// one.
    pub fn output_to_main(&self, i: usize) -> Option<u32> {
        match self.outputs.get(i) {
            Some(StepOperand::Main(idx)) => Some(*idx),
            _ => None,
        }
    }

    /// Maps step-output `i` to a temporary, if it is one.
    pub fn output_to_temporary(&self, i: usize) -> Option<SourceOperandIndex> {
        match self.outputs.get(i) {
            Some(StepOperand::Temporary(source)) => Some(*source),
            _ => None,
        }
    }

    /// Temporaries this step reads.
    pub fn consumed_temporaries(&self) -> impl Iterator<Item = SourceOperandIndex> + '_ {
        self.inputs.iter().filter_map(|op| match op {
            StepOperand::Temporary(source) => Some(*source),
            StepOperand::Main(_) => None,
        })
    }

    /// Temporaries this step writes.
    pub fn produced_temporaries(&self) -> impl Iterator<Item = SourceOperandIndex> + '_ {
        self.outputs.iter().filter_map(|op| match op {
            StepOperand::Temporary(source) => Some(*source),
            StepOperand::Main(_) => None,
        })
    }

    /// Returns `true` if this step was assigned to the CPU device.
    pub fn is_cpu(&self) -> bool {
        self.device.is_cpu()
    }
}

impl std::fmt::Debug for ExecutionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStep")
            .field("index", &self.index)
            .field("device", &self.device.name())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}
