// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # memory-manager
//!
//! The staging allocator: budget-enforced pooled host memory for the
//! buffers an execution needs beyond what the caller bound.
//!
//! Two consumers:
//!
//! - **Dynamic temporaries** — inter-step intermediates whose sizes are
//!   learned at runtime. The insufficient-size retry path frees and
//!   re-stages the same temporary at growing sizes, so returned buffers
//!   go into a free list binned by size class.
//! - **Fallback shadows** — host-visible stand-ins for opaque device
//!   memory while a step runs on the CPU.
//!
//! # Ownership Model
//!
//! ```text
//! StagingPool::stage(size)
//!       │
//!       ▼
//!   StagingGuard ◄── owns the staging slot, holds Arc<PoolInner>
//!       │  .buffer()          shared HostBuffer views for driver calls
//!       │  drop()
//!       ▼
//!   PoolInner::return_buffer() ──► free list (if no driver view remains)
//! ```
//!
//! The guard stays with the execution; drivers only ever see cloned
//! [`device_api::HostBuffer`] handles. On drop, the storage is recycled
//! only if those handles are gone — otherwise it is simply released.

mod budget;
mod error;
mod guard;
pub mod pool;
mod stats;

pub use budget::MemoryBudget;
pub use error::MemoryError;
pub use guard::StagingGuard;
pub use pool::StagingPool;
pub use stats::PoolStats;
