// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The stable result-code surface shared with drivers.

use std::fmt;

/// Result codes threaded through driver calls and published as the
/// terminal status of an execution.
///
/// Driver entry points return an `ErrorCode` alongside their payload
/// rather than a `Result`, because several codes carry payload with
/// them (`OutputInsufficientSize` arrives together with the shape
/// vector that describes what was insufficient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    NoError,
    BadData,
    BadState,
    OpFailed,
    OutputInsufficientSize,
    MissedDeadlineTransient,
    MissedDeadlinePersistent,
}

impl ErrorCode {
    /// Returns `true` for `NoError`.
    pub fn is_ok(self) -> bool {
        self == ErrorCode::NoError
    }

    /// Returns `true` for the two deadline-miss codes. Deadline misses
    /// are authoritative: they never trigger CPU fallback.
    pub fn is_deadline_miss(self) -> bool {
        matches!(
            self,
            ErrorCode::MissedDeadlineTransient | ErrorCode::MissedDeadlinePersistent
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::BadData => "BAD_DATA",
            ErrorCode::BadState => "BAD_STATE",
            ErrorCode::OpFailed => "OP_FAILED",
            ErrorCode::OutputInsufficientSize => "OUTPUT_INSUFFICIENT_SIZE",
            ErrorCode::MissedDeadlineTransient => "MISSED_DEADLINE_TRANSIENT",
            ErrorCode::MissedDeadlinePersistent => "MISSED_DEADLINE_PERSISTENT",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_classification() {
        assert!(ErrorCode::MissedDeadlineTransient.is_deadline_miss());
        assert!(ErrorCode::MissedDeadlinePersistent.is_deadline_miss());
        assert!(!ErrorCode::OpFailed.is_deadline_miss());
        assert!(!ErrorCode::NoError.is_deadline_miss());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", ErrorCode::OutputInsufficientSize), "OUTPUT_INSUFFICIENT_SIZE");
    }
}
