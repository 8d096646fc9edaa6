// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Scripted driver doubles for the engine integration tests.
//!
//! A [`FakeDevice`] pops pre-programmed outcomes per execution and
//! records every request it sees, so tests can assert both what the
//! engine published and what it actually sent to the driver.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use device_api::{
    Burst, Device, DeviceBuffer, ErrorCode, ExecutionContext, ExecutionPreference, FencedCallback,
    FencedOutcome, HostBuffer, HostPoolMemory, IoKind, MemoryValidator, OutputShape, PoolMemory,
    PreparedModel, Priority, Request, RequestArgument, StepOutcome, SyncFence, Timing,
};
use operand_core::{Dimensions, ModelSpec};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One pre-programmed fenced outcome.
pub struct FencedScript {
    pub code: ErrorCode,
    pub fence: Option<SyncFence>,
    pub callback: Option<Arc<dyn FencedCallback>>,
    pub timing: Timing,
}

/// Everything a recorded execution saw.
#[derive(Clone)]
pub struct RecordedCall {
    pub inputs: Vec<RequestArgument>,
    pub outputs: Vec<RequestArgument>,
    /// Host-visible contents of each request pool at call time.
    pub pool_contents: Vec<Option<Vec<u8>>>,
    pub loop_timeout: Option<Duration>,
    pub measure_timing: bool,
}

fn record(request: &Request, ctx: &ExecutionContext) -> RecordedCall {
    RecordedCall {
        inputs: request.inputs.clone(),
        outputs: request.outputs.clone(),
        pool_contents: request
            .pools
            .iter()
            .map(|p| p.host_memory().map(|b| b.to_vec()))
            .collect(),
        loop_timeout: ctx.loop_timeout,
        measure_timing: ctx.measure_timing,
    }
}

#[derive(Default)]
struct FakeState {
    script: Mutex<VecDeque<StepOutcome>>,
    fenced_script: Mutex<VecDeque<FencedScript>>,
    calls: Mutex<Vec<RecordedCall>>,
    fenced_waits: Mutex<Vec<Vec<SyncFence>>>,
    executions: AtomicUsize,
    prepare_count: AtomicUsize,
}

/// A scripted device.
pub struct FakeDevice {
    name: String,
    cpu: bool,
    state: Arc<FakeState>,
}

impl FakeDevice {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            cpu: false,
            state: Arc::new(FakeState::default()),
        })
    }

    pub fn cpu() -> Arc<Self> {
        Arc::new(Self {
            name: "cpu".to_string(),
            cpu: true,
            state: Arc::new(FakeState::default()),
        })
    }

    /// Enqueues a successful outcome.
    pub fn push_ok(&self, shapes: Vec<OutputShape>, timing: Timing) {
        self.push(ErrorCode::NoError, shapes, timing);
    }

    /// Enqueues an arbitrary outcome.
    pub fn push(&self, code: ErrorCode, shapes: Vec<OutputShape>, timing: Timing) {
        lock(&self.state.script).push_back(StepOutcome {
            code,
            shapes,
            timing,
        });
    }

    /// Enqueues a fenced outcome.
    pub fn push_fenced(&self, script: FencedScript) {
        lock(&self.state.fenced_script).push_back(script);
    }

    /// Number of (blocking) executions this device has served.
    pub fn executions(&self) -> usize {
        self.state.executions.load(Ordering::Acquire)
    }

    /// Number of `prepare_model` calls.
    pub fn prepare_count(&self) -> usize {
        self.state.prepare_count.load(Ordering::Acquire)
    }

    /// Recorded blocking calls, oldest first.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.state.calls).clone()
    }

    /// Recorded fenced wait lists, oldest first.
    pub fn fenced_waits(&self) -> Vec<Vec<SyncFence>> {
        lock(&self.state.fenced_waits).clone()
    }
}

impl Device for FakeDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_cpu(&self) -> bool {
        self.cpu
    }

    fn prepare_model(
        &self,
        _model: &ModelSpec,
        _preference: ExecutionPreference,
        _priority: Priority,
    ) -> Result<Arc<dyn PreparedModel>, ErrorCode> {
        self.state.prepare_count.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(FakePrepared {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakePrepared {
    state: Arc<FakeState>,
}

impl PreparedModel for FakePrepared {
    fn execute(
        &self,
        request: &Request,
        _burst: Option<&Arc<dyn Burst>>,
        ctx: &ExecutionContext,
    ) -> StepOutcome {
        self.state.executions.fetch_add(1, Ordering::AcqRel);
        lock(&self.state.calls).push(record(request, ctx));
        lock(&self.state.script).pop_front().unwrap_or(StepOutcome {
            code: ErrorCode::NoError,
            shapes: Vec::new(),
            timing: Timing::unavailable(),
        })
    }

    fn execute_fenced(
        &self,
        request: &Request,
        wait_for: &[SyncFence],
        ctx: &ExecutionContext,
        _timeout_after_fence: Option<Duration>,
    ) -> FencedOutcome {
        lock(&self.state.fenced_waits).push(wait_for.to_vec());
        lock(&self.state.calls).push(record(request, ctx));
        match lock(&self.state.fenced_script).pop_front() {
            Some(script) => FencedOutcome {
                code: script.code,
                fence: script.fence,
                callback: script.callback,
                timing: script.timing,
            },
            None => FencedOutcome::error(ErrorCode::OpFailed),
        }
    }
}

/// A canned fenced-callback with fixed timings.
pub struct FakeFencedCallback {
    pub status: ErrorCode,
    pub launched: Timing,
    pub fenced: Timing,
}

impl FencedCallback for FakeFencedCallback {
    fn execution_info(&self) -> (ErrorCode, Timing, Timing) {
        (self.status, self.launched, self.fenced)
    }
}

// ── Device-memory pool double ──────────────────────────────────

struct FakeDeviceBuffer {
    contents: HostBuffer,
}

impl DeviceBuffer for FakeDeviceBuffer {
    fn copy_to_host(&self, dst: &HostBuffer) -> Result<(), ErrorCode> {
        if dst.copy_from_slice(&self.contents.to_vec()) {
            Ok(())
        } else {
            Err(ErrorCode::OpFailed)
        }
    }

    fn copy_from_host(&self, src: &HostBuffer) -> Result<(), ErrorCode> {
        if self.contents.copy_from_slice(&src.to_vec()) {
            Ok(())
        } else {
            Err(ErrorCode::OpFailed)
        }
    }
}

/// A pool backed by opaque "device" memory; CPU fallback must shadow it.
pub struct FakeDevicePool {
    device: FakeDeviceBuffer,
    host_mirror: HostPoolMemory,
    unknown_shape: bool,
}

impl FakeDevicePool {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            device: FakeDeviceBuffer {
                contents: HostBuffer::new_zeroed(size),
            },
            host_mirror: HostPoolMemory::new(size),
            unknown_shape: false,
        })
    }

    pub fn with_unknown_shape(size: usize) -> Arc<Self> {
        Arc::new(Self {
            device: FakeDeviceBuffer {
                contents: HostBuffer::new_zeroed(size),
            },
            host_mirror: HostPoolMemory::with_unknown_shape(size),
            unknown_shape: true,
        })
    }

    /// Writes bytes straight into the "device" storage.
    pub fn poke(&self, data: &[u8]) {
        self.device.contents.copy_from_slice(data);
    }

    /// Reads the "device" storage back.
    pub fn peek(&self) -> Vec<u8> {
        self.device.contents.to_vec()
    }
}

impl PoolMemory for FakeDevicePool {
    fn logical_size(&self) -> usize {
        self.device.contents.len()
    }

    fn host_memory(&self) -> Option<HostBuffer> {
        None
    }

    fn device_buffer(&self) -> Option<&dyn DeviceBuffer> {
        Some(&self.device)
    }

    fn validator(&self) -> &dyn MemoryValidator {
        self
    }
}

impl MemoryValidator for FakeDevicePool {
    fn validate(
        &self,
        io: IoKind,
        index: u32,
        override_dims: Option<&Dimensions>,
        offset: usize,
        length: usize,
    ) -> bool {
        self.host_mirror
            .validator()
            .validate(io, index, override_dims, offset, length)
    }

    fn validate_input_dimensions(&self, dims: &Dimensions) -> bool {
        self.host_mirror.validator().validate_input_dimensions(dims)
    }

    fn update_metadata(&self, dims: &Dimensions) -> bool {
        self.host_mirror.validator().update_metadata(dims)
    }

    fn set_initialized(&self, initialized: bool) {
        self.host_mirror.validator().set_initialized(initialized);
    }

    fn created_with_unknown_shape(&self) -> bool {
        self.unknown_shape
    }

    fn supports_whole_region(&self) -> bool {
        true
    }
}

fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}
