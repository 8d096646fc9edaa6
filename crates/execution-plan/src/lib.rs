// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # execution-plan
//!
//! Frozen, partitioned execution plans and the cursor that walks them.
//!
//! ```text
//! PlanBuilder ──build()──► Compilation  (plan + source models + devices)
//!                              │  make_controller()
//!                              ▼
//!                          Controller ──next()/fallback()──► ExecutionStep
//! ```
//!
//! Partitioning and device assignment happen elsewhere; this crate
//! receives their result, validates it once, and freezes it. The
//! engine then ticks a [`Controller`] per execution.

mod controller;
mod error;
mod plan;
mod step;

pub use controller::{Controller, Tick};
pub use error::PlanError;
pub use plan::{CompiledPlan, Compilation, PlanBuilder, StepDesc, TemporaryDecl};
pub use step::{ExecutionStep, SourceOperandIndex, StepOperand};
