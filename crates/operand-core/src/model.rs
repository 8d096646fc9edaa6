// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Frozen model metadata.
//!
//! A [`ModelSpec`] is the operand-level view of a model that execution
//! consumes: the declared operands plus which of them are the model's
//! inputs and outputs. How a model's operations were constructed and
//! typed is another subsystem's business; by the time a spec reaches
//! this crate it is immutable.

use crate::{Operand, OperandError};

/// Immutable operand metadata for one model (main model or step model).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelSpec {
    name: String,
    operands: Vec<Operand>,
    inputs: Vec<u32>,
    outputs: Vec<u32>,
}

impl ModelSpec {
    /// Creates a spec, validating that every input/output index names a
    /// declared operand.
    pub fn new(
        name: impl Into<String>,
        operands: Vec<Operand>,
        inputs: Vec<u32>,
        outputs: Vec<u32>,
    ) -> Result<Self, OperandError> {
        let count = operands.len() as u32;
        for (kind, indices) in [("input", &inputs), ("output", &outputs)] {
            for &index in indices.iter() {
                if index >= count {
                    return Err(OperandError::IndexOutOfRange { kind, index, count });
                }
            }
        }
        Ok(Self {
            name: name.into(),
            operands,
            inputs,
            outputs,
        })
    }

    /// Returns the model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the operand at `index`, if declared.
    pub fn operand(&self, index: u32) -> Option<&Operand> {
        self.operands.get(index as usize)
    }

    /// Number of model inputs.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Number of model outputs.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Operand index of input `i`.
    pub fn input_index(&self, i: usize) -> Option<u32> {
        self.inputs.get(i).copied()
    }

    /// Operand index of output `i`.
    pub fn output_index(&self, i: usize) -> Option<u32> {
        self.outputs.get(i).copied()
    }

    /// The operand declared for input `i`.
    pub fn input_operand(&self, i: usize) -> Option<&Operand> {
        self.input_index(i).and_then(|idx| self.operand(idx))
    }

    /// The operand declared for output `i`.
    pub fn output_operand(&self, i: usize) -> Option<&Operand> {
        self.output_index(i).and_then(|idx| self.operand(idx))
    }

    /// Returns `true` if any output has not-fully-specified dimensions.
    pub fn has_unspecified_outputs(&self) -> bool {
        (0..self.output_count())
            .filter_map(|i| self.output_operand(i))
            .any(|op| op.has_unspecified_dimensions())
    }

    /// One-line description for logs.
    pub fn summary(&self) -> String {
        format!(
            "model '{}': {} operands, {} inputs, {} outputs",
            self.name,
            self.operands.len(),
            self.inputs.len(),
            self.outputs.len(),
        )
    }
}
