// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # device-api
//!
//! The narrow interfaces the execution core consumes from its external
//! collaborators:
//!
//! - [`Device`] / [`PreparedModel`] / [`Burst`] — driver traits, with
//!   blocking and fenced entry points.
//! - [`PoolMemory`] / [`MemoryValidator`] / [`DeviceBuffer`] — the
//!   memory-region surface, plus the concrete host-backed
//!   [`HostPoolMemory`].
//! - [`SyncFence`] — waitable/pollable completion fences, and
//!   [`FencedCallback`] for post-completion timing queries.
//! - [`ErrorCode`], [`Timing`], [`OutputShape`] — the stable result
//!   surface shared with drivers.
//!
//! Everything here is interface plus small value types; driver
//! implementations live elsewhere.

mod buffer;
mod device;
mod error;
mod fence;
mod memory;
mod timing;

pub use buffer::HostBuffer;
pub use device::{
    wait_for_all, ArgumentLocation, Burst, Device, ExecutionContext, ExecutionPreference,
    FencedCallback, FencedOutcome, OutputShape, PreparedModel, Priority, Request,
    RequestArgument, StepOutcome,
};
pub use error::ErrorCode;
pub use fence::{FenceState, SyncFence};
pub use memory::{DeviceBuffer, HostPoolMemory, IoKind, MemoryValidator, PoolMemory};
pub use timing::{Timing, TIMING_UNAVAILABLE};
