// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Device and prepared-model traits.
//!
//! Drivers live in other subsystems; the engine consumes them through
//! these traits. A [`PreparedModel`] is a driver-side artifact ready to
//! execute one model on one device. Handles are borrowed for at least
//! the duration of a step; the engine never extends their lifetime
//! beyond publication.

use crate::{ErrorCode, FenceState, HostBuffer, PoolMemory, SyncFence, Timing};
use operand_core::{Dimensions, ModelSpec};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Compilation preference forwarded when a model is (re-)prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionPreference {
    #[default]
    FastSingleAnswer,
    LowPower,
    SustainedSpeed,
}

/// Compilation priority forwarded when a model is (re-)prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Where one request argument's data lives.
#[derive(Debug, Clone)]
pub enum ArgumentLocation {
    /// A host buffer. `data == None` is a size-discovery output slot:
    /// the driver reports the shape but has nowhere to write.
    Buffer {
        data: Option<HostBuffer>,
        length: u32,
    },
    /// A range of one of the request's memory pools.
    Pool { pool: u32, offset: u32, length: u32 },
    /// The operand deliberately has no value.
    NoValue,
}

/// One input or output of a driver request.
#[derive(Debug, Clone)]
pub struct RequestArgument {
    pub location: ArgumentLocation,
    pub dimensions: Dimensions,
}

/// A fully materialised driver request.
pub struct Request {
    pub inputs: Vec<RequestArgument>,
    pub outputs: Vec<RequestArgument>,
    pub pools: Vec<Arc<dyn PoolMemory>>,
}

/// Per-call execution knobs derived from the engine's options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionContext {
    pub measure_timing: bool,
    pub deadline: Option<Instant>,
    pub loop_timeout: Option<Duration>,
}

/// A reported shape for one output of an execution.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OutputShape {
    pub dimensions: Dimensions,
    /// Whether the provided buffer was large enough for this output.
    pub is_sufficient: bool,
}

impl OutputShape {
    /// A sufficient shape.
    pub fn sufficient(dimensions: impl Into<Dimensions>) -> Self {
        Self {
            dimensions: dimensions.into(),
            is_sufficient: true,
        }
    }

    /// An insufficient shape.
    pub fn insufficient(dimensions: impl Into<Dimensions>) -> Self {
        Self {
            dimensions: dimensions.into(),
            is_sufficient: false,
        }
    }
}

/// Result of one blocking driver execution.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub code: ErrorCode,
    pub shapes: Vec<OutputShape>,
    pub timing: Timing,
}

impl StepOutcome {
    /// An error outcome with no shapes and no timing.
    pub fn error(code: ErrorCode) -> Self {
        Self {
            code,
            shapes: Vec::new(),
            timing: Timing::unavailable(),
        }
    }
}

/// Result of one fenced driver execution.
pub struct FencedOutcome {
    pub code: ErrorCode,
    /// Fence signaled when the computation completes. `None` means the
    /// call completed synchronously (or failed).
    pub fence: Option<SyncFence>,
    /// Handle for querying post-completion status and timing.
    pub callback: Option<Arc<dyn FencedCallback>>,
    pub timing: Timing,
}

impl FencedOutcome {
    /// An error outcome carrying neither fence nor callback.
    pub fn error(code: ErrorCode) -> Self {
        Self {
            code,
            fence: None,
            callback: None,
            timing: Timing::unavailable(),
        }
    }
}

/// Post-completion query surface of a fenced execution.
pub trait FencedCallback: Send + Sync {
    /// Returns `(status, timing_launched, timing_fenced)`.
    fn execution_info(&self) -> (ErrorCode, Timing, Timing);
}

/// Opaque reusable execution session for one device.
pub trait Burst: Send + Sync {}

/// A driver-side artifact ready to execute one model.
pub trait PreparedModel: Send + Sync {
    /// Blocking execution.
    fn execute(
        &self,
        request: &Request,
        burst: Option<&Arc<dyn Burst>>,
        ctx: &ExecutionContext,
    ) -> StepOutcome;

    /// Fenced execution: returns after launch, completion is observed
    /// through the returned fence. Drivers without fenced support keep
    /// the default.
    fn execute_fenced(
        &self,
        _request: &Request,
        _wait_for: &[SyncFence],
        _ctx: &ExecutionContext,
        _timeout_after_fence: Option<Duration>,
    ) -> FencedOutcome {
        FencedOutcome::error(ErrorCode::OpFailed)
    }
}

/// A compute device.
pub trait Device: Send + Sync {
    /// Driver-reported device name.
    fn name(&self) -> &str;

    /// Returns `true` for the built-in CPU device. The recovery policy
    /// keys off this: a failing step already on CPU has nowhere further
    /// to fall.
    fn is_cpu(&self) -> bool {
        false
    }

    /// Prepares `model` for execution on this device.
    fn prepare_model(
        &self,
        model: &ModelSpec,
        preference: ExecutionPreference,
        priority: Priority,
    ) -> Result<Arc<dyn PreparedModel>, ErrorCode>;

    /// Opens a reusable execution session, if the driver supports one.
    fn open_burst(&self) -> Option<Arc<dyn Burst>> {
        None
    }
}

/// Blocks until every fence in `fences` signals.
///
/// Returns `Ok(())` only if all signal successfully; the first fence
/// observed in the `Error` state fails the wait.
pub fn wait_for_all(fences: &[SyncFence]) -> Result<(), ErrorCode> {
    for fence in fences {
        if fence.wait(None) != FenceState::Signaled {
            tracing::debug!("fence wait failed");
            return Err(ErrorCode::OpFailed);
        }
    }
    Ok(())
}
