// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for plan construction.

use crate::SourceOperandIndex;

/// Errors raised while assembling a [`crate::Compilation`].
///
/// These all indicate partitioner bugs: a frozen plan that reaches the
/// engine has already passed this validation.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The plan has no steps.
    #[error("plan has no steps")]
    EmptyPlan,

    /// A step's operand list disagrees with its step model.
    #[error("step {step}: {kind} list has {declared} entries but the step model declares {expected}")]
    OperandCountMismatch {
        step: usize,
        kind: &'static str,
        declared: usize,
        expected: usize,
    },

    /// A step references a main-model input/output that does not exist.
    #[error("step {step}: main {kind} index {index} out of range ({count} declared)")]
    MainIndexOutOfRange {
        step: usize,
        kind: &'static str,
        index: u32,
        count: usize,
    },

    /// A step references an undeclared temporary.
    #[error("step {step}: temporary {operand:?} was never declared")]
    UnknownTemporary {
        step: usize,
        operand: SourceOperandIndex,
    },

    /// A temporary is produced by more than one step.
    #[error("temporary {operand:?} is produced by steps {first} and {second}")]
    DuplicateProducer {
        operand: SourceOperandIndex,
        first: usize,
        second: usize,
    },

    /// A temporary is consumed at or before the step that produces it.
    #[error("temporary {operand:?} consumed by step {consumer} but produced by step {producer}")]
    ConsumedBeforeProduced {
        operand: SourceOperandIndex,
        consumer: usize,
        producer: usize,
    },

    /// A declared temporary is never produced by any step.
    #[error("temporary {operand:?} is declared but no step produces it")]
    NeverProduced { operand: SourceOperandIndex },

    /// A simple plan carries structure only compound plans may have.
    #[error("simple plan constraint violated: {0}")]
    SimplePlanConstraint(&'static str),

    /// A step names a source model index that was not registered.
    #[error("step {step}: source model {model} not registered")]
    UnknownSourceModel { step: usize, model: u32 },
}
