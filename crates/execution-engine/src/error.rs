// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the execution engine.

use device_api::ErrorCode;

/// Errors surfaced by the engine's public API.
///
/// The rich variants carry context for logs; [`EngineError::code`]
/// projects each onto the stable [`ErrorCode`] surface shared with
/// drivers and the outer API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed arguments: bad index, conflicting dimension override,
    /// oversized length, or re-binding a bound slot.
    #[error("bad data: {0}")]
    BadData(String),

    /// Called out of lifecycle order.
    #[error("bad state: {0}")]
    BadState(String),

    /// The execution failed.
    #[error("operation failed: {0}")]
    OpFailed(String),

    /// A caller-provided output buffer was too small.
    #[error("output buffer insufficient")]
    OutputInsufficientSize,

    /// The overall deadline expired; a retry may succeed.
    #[error("missed deadline (transient)")]
    MissedDeadlineTransient,

    /// The overall deadline expired; a retry will not succeed.
    #[error("missed deadline (persistent)")]
    MissedDeadlinePersistent,

    /// The staging allocator refused an allocation.
    #[error("staging error: {0}")]
    Staging(#[from] memory_manager::MemoryError),
}

impl EngineError {
    /// Projects onto the stable result-code surface.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::BadData(_) => ErrorCode::BadData,
            EngineError::BadState(_) => ErrorCode::BadState,
            EngineError::OpFailed(_) => ErrorCode::OpFailed,
            EngineError::OutputInsufficientSize => ErrorCode::OutputInsufficientSize,
            EngineError::MissedDeadlineTransient => ErrorCode::MissedDeadlineTransient,
            EngineError::MissedDeadlinePersistent => ErrorCode::MissedDeadlinePersistent,
            EngineError::Staging(_) => ErrorCode::OpFailed,
        }
    }

    /// Lifts a non-`NoError` code back into an error value.
    pub fn from_code(code: ErrorCode, context: &str) -> Self {
        match code {
            ErrorCode::NoError => {
                // Callers only reach here with a failing code.
                EngineError::OpFailed(format!("{context}: unexpected NO_ERROR"))
            }
            ErrorCode::BadData => EngineError::BadData(context.to_string()),
            ErrorCode::BadState => EngineError::BadState(context.to_string()),
            ErrorCode::OpFailed => EngineError::OpFailed(context.to_string()),
            ErrorCode::OutputInsufficientSize => EngineError::OutputInsufficientSize,
            ErrorCode::MissedDeadlineTransient => EngineError::MissedDeadlineTransient,
            ErrorCode::MissedDeadlinePersistent => EngineError::MissedDeadlinePersistent,
        }
    }
}
