// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The execution engine.
//!
//! One [`ExecutionEngine`] drives one end-to-end inference against a
//! frozen [`Compilation`]. Its lifecycle:
//!
//! ```text
//! Configuring ──(first compute call)──► Started ──► Finished
//! ```
//!
//! In `Configuring`, bindings and options may be set; the transition to
//! `Started` is irrevocable and validates every slot. The step loop
//! then walks the plan, propagating driver-reported shapes between
//! steps and applying the recovery ladder — insufficient-size retry,
//! partial CPU fallback, full CPU fallback — until a terminal record is
//! published exactly once. Deadline misses are authoritative and never
//! fall back.
//!
//! Three completion modes share the same loop: blocking (caller's
//! thread), background (one worker thread, observed through an
//! [`ExecutionHandle`]), and fenced (caller's thread, completion
//! observed through the terminal [`SyncFence`]).

use crate::{
    initial_output_shapes_from, ArgumentBinding, BindingState, CompletedMode, Completion,
    CompletionCell, DurationCode, DynamicTemporaryTable, EngineCompletion, EngineConfig,
    EngineError, StepExecutor, TerminalState, UpdateFlags,
};
use crate::step::{ExecutionArgs, TimingSink};
use device_api::{
    wait_for_all, ErrorCode, FenceState, FencedCallback, HostBuffer, IoKind, OutputShape,
    PoolMemory, SyncFence, Timing, TIMING_UNAVAILABLE,
};
use execution_plan::{Compilation, Tick};
use memory_manager::{MemoryBudget, StagingPool};
use operand_core::Dimensions;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::MAX_LOOP_TIMEOUT;

/// Mutable pre-start state, frozen into an [`ExecutionArgs`] snapshot
/// when the execution starts.
struct ConfigState {
    inputs: Vec<ArgumentBinding>,
    outputs: Vec<ArgumentBinding>,
    pools: Vec<Arc<dyn PoolMemory>>,
    measure_timing: bool,
    timeout: Option<Duration>,
    loop_timeout: Duration,
    started: bool,
}

struct EngineInner {
    compilation: Arc<Compilation>,
    staging_budget: MemoryBudget,
    sync_exec: bool,
    state: Mutex<ConfigState>,
    terminal: CompletionCell,
    /// Launched-timing side channel, updated as steps report.
    timing: TimingSink,
}

/// Drives a single inference to completion. Cheap to clone; clones
/// share the execution.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    /// Creates an engine bound to `compilation`.
    pub fn new(
        compilation: Arc<Compilation>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let staging_budget = config.parse_staging_budget()?;
        let main = compilation.main_model();
        let state = ConfigState {
            inputs: vec![ArgumentBinding::unspecified(); main.input_count()],
            outputs: vec![ArgumentBinding::unspecified(); main.output_count()],
            pools: Vec::new(),
            measure_timing: false,
            timeout: None,
            loop_timeout: config.resolve_loop_timeout(),
            started: false,
        };
        tracing::debug!(
            inputs = main.input_count(),
            outputs = main.output_count(),
            "execution engine created"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                compilation,
                staging_budget,
                sync_exec: config.sync_exec,
                state: Mutex::new(state),
                terminal: CompletionCell::new(),
                timing: Arc::new(Mutex::new(Timing::unavailable())),
            }),
        })
    }

    /// The compilation this execution runs against.
    pub fn compilation(&self) -> &Arc<Compilation> {
        &self.inner.compilation
    }

    // ── Binding ────────────────────────────────────────────────

    /// Binds input `index` to a host buffer (or, with a dimension
    /// override and no buffer, to no-value).
    pub fn set_input(
        &self,
        index: usize,
        override_dims: Option<&Dimensions>,
        data: Option<HostBuffer>,
        length: usize,
    ) -> Result<(), EngineError> {
        let mut state = self.lock_state();
        if state.started {
            return Err(EngineError::BadState(
                "set_input called after the execution has started".into(),
            ));
        }
        let operand = self
            .inner
            .compilation
            .main_model()
            .input_operand(index)
            .ok_or_else(|| EngineError::BadData(format!("input index {index} out of range")))?;
        if !state.inputs[index].is_unspecified() {
            return Err(EngineError::BadData(format!(
                "input {index} has already been provided"
            )));
        }
        state.inputs[index] =
            ArgumentBinding::from_buffer(operand, override_dims, data, length, IoKind::Input)?;
        Ok(())
    }

    /// Binds input `index` to a range of `pool`.
    pub fn set_input_from_memory(
        &self,
        index: usize,
        override_dims: Option<&Dimensions>,
        pool: Arc<dyn PoolMemory>,
        offset: usize,
        mut length: usize,
    ) -> Result<(), EngineError> {
        let mut state = self.lock_state();
        if state.started {
            return Err(EngineError::BadState(
                "set_input_from_memory called after the execution has started".into(),
            ));
        }
        let operand = self
            .inner
            .compilation
            .main_model()
            .input_operand(index)
            .ok_or_else(|| EngineError::BadData(format!("input index {index} out of range")))?;
        if !state.inputs[index].is_unspecified() {
            return Err(EngineError::BadData(format!(
                "input {index} has already been provided"
            )));
        }
        if !pool
            .validator()
            .validate(IoKind::Input, index as u32, override_dims, offset, length)
        {
            return Err(EngineError::BadData(format!(
                "memory region rejected for input {index}"
            )));
        }
        if offset == 0 && length == 0 && pool.validator().supports_whole_region() {
            length = pool.logical_size();
        }
        let pool_index = register_pool(&mut state.pools, pool);
        state.inputs[index] = ArgumentBinding::from_memory(
            operand,
            override_dims,
            pool_index,
            offset,
            length,
            IoKind::Input,
        )?;
        Ok(())
    }

    /// Binds output `index` to a host buffer (null = size discovery).
    pub fn set_output(
        &self,
        index: usize,
        override_dims: Option<&Dimensions>,
        data: Option<HostBuffer>,
        length: usize,
    ) -> Result<(), EngineError> {
        let mut state = self.lock_state();
        if state.started {
            return Err(EngineError::BadState(
                "set_output called after the execution has started".into(),
            ));
        }
        let operand = self
            .inner
            .compilation
            .main_model()
            .output_operand(index)
            .ok_or_else(|| EngineError::BadData(format!("output index {index} out of range")))?;
        if !state.outputs[index].is_unspecified() {
            return Err(EngineError::BadData(format!(
                "output {index} has already been provided"
            )));
        }
        state.outputs[index] =
            ArgumentBinding::from_buffer(operand, override_dims, data, length, IoKind::Output)?;
        Ok(())
    }

    /// Binds output `index` to a range of `pool`.
    pub fn set_output_from_memory(
        &self,
        index: usize,
        override_dims: Option<&Dimensions>,
        pool: Arc<dyn PoolMemory>,
        offset: usize,
        mut length: usize,
    ) -> Result<(), EngineError> {
        let mut state = self.lock_state();
        if state.started {
            return Err(EngineError::BadState(
                "set_output_from_memory called after the execution has started".into(),
            ));
        }
        let operand = self
            .inner
            .compilation
            .main_model()
            .output_operand(index)
            .ok_or_else(|| EngineError::BadData(format!("output index {index} out of range")))?;
        if !state.outputs[index].is_unspecified() {
            return Err(EngineError::BadData(format!(
                "output {index} has already been provided"
            )));
        }
        if !pool
            .validator()
            .validate(IoKind::Output, index as u32, override_dims, offset, length)
        {
            return Err(EngineError::BadData(format!(
                "memory region rejected for output {index}"
            )));
        }
        if offset == 0 && length == 0 && pool.validator().supports_whole_region() {
            length = pool.logical_size();
        }
        let pool_index = register_pool(&mut state.pools, pool);
        state.outputs[index] = ArgumentBinding::from_memory(
            operand,
            override_dims,
            pool_index,
            offset,
            length,
            IoKind::Output,
        )?;
        Ok(())
    }

    // ── Options ────────────────────────────────────────────────

    /// Enables or disables timing measurement. Only legal for
    /// compilations created against an explicit single-device list.
    pub fn set_measure_timing(&self, measure: bool) -> Result<(), EngineError> {
        if !self.inner.compilation.explicit_single_device() {
            return Err(EngineError::BadData(
                "measure_timing requires a compilation with an explicit single device".into(),
            ));
        }
        let mut state = self.lock_state();
        if state.started {
            return Err(EngineError::BadState(
                "set_measure_timing called after the execution has started".into(),
            ));
        }
        state.measure_timing = measure;
        Ok(())
    }

    /// Sets the overall execution timeout. `None` (or zero) clears it.
    pub fn set_timeout(&self, duration: Option<Duration>) -> Result<(), EngineError> {
        let duration = duration.filter(|d| !d.is_zero());
        if duration.is_some() && !self.inner.compilation.explicit_single_device() {
            return Err(EngineError::BadData(
                "timeout requires a compilation with an explicit single device".into(),
            ));
        }
        let mut state = self.lock_state();
        if state.started {
            return Err(EngineError::BadState(
                "set_timeout called after the execution has started".into(),
            ));
        }
        state.timeout = duration;
        Ok(())
    }

    /// Sets the per-loop timeout drivers apply to interpreted control
    /// flow. Values above the implementation maximum are clamped.
    pub fn set_loop_timeout(&self, duration: Duration) -> Result<(), EngineError> {
        let mut state = self.lock_state();
        if state.started {
            return Err(EngineError::BadState(
                "set_loop_timeout called after the execution has started".into(),
            ));
        }
        state.loop_timeout = if duration > MAX_LOOP_TIMEOUT {
            tracing::warn!(
                "loop timeout {duration:?} exceeds maximum, clamping to {MAX_LOOP_TIMEOUT:?}"
            );
            MAX_LOOP_TIMEOUT
        } else {
            duration
        };
        Ok(())
    }

    // ── Completion modes ───────────────────────────────────────

    /// Blocking synchronous execution: runs the step loop on the
    /// caller's thread and publishes before returning.
    pub fn compute(&self) -> Result<(), EngineError> {
        let args = self.begin_compute(false)?;
        tracing::debug!("compute (synchronous)");
        run_plan_loop(&self.inner, args);
        self.result_from_terminal()
    }

    /// Background execution: the step loop runs on a worker thread
    /// (inline when the runtime is configured for no-thread execution).
    pub fn compute_background(&self) -> Result<ExecutionHandle, EngineError> {
        let args = self.begin_compute(false)?;
        if self.inner.sync_exec {
            tracing::debug!("compute (background, inline)");
            run_plan_loop(&self.inner, args);
            return Ok(ExecutionHandle {
                engine: self.clone(),
                worker: None,
            });
        }
        tracing::debug!("compute (background, worker thread)");
        let inner = Arc::clone(&self.inner);
        let worker = thread::spawn(move || run_plan_loop(&inner, args));
        Ok(ExecutionHandle {
            engine: self.clone(),
            worker: Some(worker),
        })
    }

    /// Fenced execution: the loop runs on the caller's thread, each
    /// step waiting on the previous step's fence (the first on
    /// `wait_for`). On success returns the terminal fence, or `None`
    /// if the execution completed synchronously.
    pub fn compute_fenced(
        &self,
        wait_for: Vec<SyncFence>,
        timeout_after_fence: Option<Duration>,
    ) -> Result<Option<SyncFence>, EngineError> {
        if self.lock_state().started {
            return Err(EngineError::BadState(
                "compute_fenced called on an execution that has already started".into(),
            ));
        }
        if timeout_after_fence.is_some_and(|d| !d.is_zero())
            && !self.inner.compilation.explicit_single_device()
        {
            return Err(EngineError::BadData(
                "after-fence timeout requires a compilation with an explicit single device".into(),
            ));
        }
        let args = self.begin_compute(true)?;
        tracing::debug!("compute (fenced)");
        let (code, fence, callback) =
            run_fenced_loop(&self.inner, &args, wait_for, timeout_after_fence);
        if code != ErrorCode::NoError {
            return Err(EngineError::from_code(code, "fenced execution failed"));
        }
        match fence {
            Some(fence) => {
                self.inner.terminal.publish_with_fence(
                    fence.clone(),
                    callback,
                    initial_output_shapes_from(&args.outputs),
                );
                Ok(Some(fence))
            }
            None => Ok(None),
        }
    }

    // ── Terminal queries ───────────────────────────────────────

    /// Whether the execution has reached a terminal state. For
    /// fence-bearing executions this is a zero-timeout fence poll, so
    /// it becomes true monotonically.
    pub fn is_finished(&self) -> bool {
        self.inner.terminal.with(|state| match state {
            TerminalState::Pending => false,
            TerminalState::WithoutFence(_) => true,
            TerminalState::WithFence { fence, .. } => fence.poll() != FenceState::Active,
        })
    }

    /// Classifies the finished execution.
    pub fn completed_with(&self) -> Result<Completion, EngineError> {
        self.inner.terminal.with(|state| match state {
            TerminalState::Pending => Err(EngineError::BadState(
                "execution has not finished".into(),
            )),
            TerminalState::WithoutFence(c) => Ok(match c.status {
                ErrorCode::NoError => Completion::NoError,
                ErrorCode::OutputInsufficientSize => Completion::OutputInsufficientSize,
                _ => Completion::OtherError,
            }),
            TerminalState::WithFence { fence, .. } => match fence.poll() {
                FenceState::Signaled => Ok(Completion::NoError),
                FenceState::Error => Ok(Completion::OtherError),
                FenceState::Active => Err(EngineError::BadState(
                    "execution has not finished".into(),
                )),
            },
        })
    }

    /// The final dimensions of output `index`.
    ///
    /// Returns `OutputInsufficientSize` iff the slot's buffer proved
    /// too small; querying a scalar output is `BadData`.
    pub fn output_dimensions(&self, index: usize) -> Result<Vec<u32>, EngineError> {
        let shape = self.finished_output_shape(index)?;
        if shape.dimensions.rank() == 0 {
            return Err(EngineError::BadData(
                "cannot query dimensions of a scalar".into(),
            ));
        }
        if !shape.is_sufficient {
            return Err(EngineError::OutputInsufficientSize);
        }
        Ok(shape.dimensions.as_slice().to_vec())
    }

    /// The final rank of output `index`.
    pub fn output_rank(&self, index: usize) -> Result<usize, EngineError> {
        let shape = self.finished_output_shape(index)?;
        if !shape.is_sufficient {
            return Err(EngineError::OutputInsufficientSize);
        }
        Ok(shape.dimensions.rank())
    }

    /// Driver-reported duration in nanoseconds, preserving the
    /// `u64::MAX` "unavailable" sentinel. Requires a finished,
    /// successful execution with timing measurement enabled.
    pub fn duration(&self, code: DurationCode) -> Result<u64, EngineError> {
        if !self.is_finished() {
            return Err(EngineError::BadState(
                "duration queried before the execution has finished".into(),
            ));
        }
        if self.completed_with()? != Completion::NoError {
            return Err(EngineError::BadState(
                "duration queried on an execution that encountered an error".into(),
            ));
        }
        if !self.lock_state().measure_timing {
            return Err(EngineError::BadState("timing measurement was not enabled".into()));
        }

        let launched = match self.inner.timing.lock() {
            Ok(t) => *t,
            Err(p) => *p.into_inner(),
        };
        let callback = self.fenced_callback();
        let (launched, fenced) = match callback {
            Some(callback) => {
                let (status, launched, fenced) = callback.execution_info();
                if status != ErrorCode::NoError {
                    return Err(EngineError::BadState(
                        "fenced callback reported an error".into(),
                    ));
                }
                (launched, fenced)
            }
            None => (launched, launched),
        };

        let micros = match code {
            DurationCode::OnHardware => launched.on_device_us,
            DurationCode::InDriver => launched.in_driver_us,
            DurationCode::FencedOnHardware => fenced.on_device_us,
            DurationCode::FencedInDriver => fenced.in_driver_us,
        };
        // Drivers report µs; the query surface is ns.
        Ok(if micros == TIMING_UNAVAILABLE {
            u64::MAX
        } else {
            micros.saturating_mul(1000)
        })
    }

    // ── Internals ──────────────────────────────────────────────

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConfigState> {
        match self.inner.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn fenced_callback(&self) -> Option<Arc<dyn FencedCallback>> {
        self.inner.terminal.with(|state| match state {
            TerminalState::WithFence { callback, .. } => callback.clone(),
            _ => None,
        })
    }

    fn finished_output_shape(&self, index: usize) -> Result<OutputShape, EngineError> {
        if self.completed_with()? == Completion::OtherError {
            return Err(EngineError::BadState(
                "output queried on an execution that encountered an error".into(),
            ));
        }
        self.inner.terminal.with(|state| {
            let shapes = match state {
                TerminalState::WithoutFence(c) => &c.output_shapes,
                TerminalState::WithFence { output_shapes, .. } => output_shapes,
                TerminalState::Pending => {
                    // completed_with above guarantees a published state.
                    return Err(EngineError::BadState("execution has not finished".into()));
                }
            };
            shapes
                .get(index)
                .cloned()
                .ok_or_else(|| EngineError::BadData(format!("output index {index} out of range")))
        })
    }

    /// Validates bindings, marks the execution started, and snapshots
    /// the arguments the step loop runs against.
    fn begin_compute(&self, fenced: bool) -> Result<ExecutionArgs, EngineError> {
        let mut state = self.lock_state();
        if state.started {
            return Err(EngineError::BadState(
                "compute called on an execution that has already started".into(),
            ));
        }

        for (i, binding) in state.inputs.iter().enumerate() {
            if binding.is_unspecified() {
                return Err(EngineError::BadData(format!("input {i} is not specified")));
            }
            if !fenced {
                if let BindingState::Memory { pool, .. } = binding.state() {
                    let pool = &state.pools[*pool as usize];
                    if !pool.validator().validate_input_dimensions(binding.dimensions()) {
                        return Err(EngineError::OpFailed(format!(
                            "memory pool disagrees with dimensions of input {i}"
                        )));
                    }
                }
            }
        }
        for (i, binding) in state.outputs.iter().enumerate() {
            if binding.is_unspecified() {
                return Err(EngineError::BadData(format!("output {i} is not specified")));
            }
        }

        if fenced {
            if self.inner.compilation.plan().has_dynamic_temporaries() {
                return Err(EngineError::BadData(
                    "fenced execution does not support dynamic temporaries".into(),
                ));
            }
            let main = self.inner.compilation.main_model();
            for (i, binding) in state.outputs.iter().enumerate() {
                if binding.has_no_value() {
                    continue;
                }
                let is_tensor = main.output_operand(i).map(|op| op.is_tensor()).unwrap_or(false);
                if is_tensor && !binding.dimensions().is_fully_specified() {
                    return Err(EngineError::BadData(format!(
                        "fenced execution requires fully specified dimensions for output {i}"
                    )));
                }
            }
        }

        state.started = true;
        tracing::debug!("execution started");
        Ok(ExecutionArgs {
            inputs: state.inputs.clone(),
            outputs: state.outputs.clone(),
            pools: state.pools.clone(),
            measure_timing: state.measure_timing,
            deadline: state.timeout.map(|t| Instant::now() + t),
            loop_timeout: state.loop_timeout,
            allow_cpu_fallback: !self.inner.compilation.explicit_single_device(),
        })
    }

    fn result_from_terminal(&self) -> Result<(), EngineError> {
        self.inner.terminal.with(|state| match state {
            TerminalState::WithoutFence(c) if c.status == ErrorCode::NoError => Ok(()),
            TerminalState::WithoutFence(c) => {
                Err(EngineError::from_code(c.status, "execution failed"))
            }
            _ => Err(EngineError::OpFailed("execution published no record".into())),
        })
    }
}

/// Handle onto a background execution.
///
/// The worker owns the step loop end-to-end; `wait` joins it and
/// observes the published record under a single happens-before edge.
pub struct ExecutionHandle {
    engine: ExecutionEngine,
    worker: Option<thread::JoinHandle<()>>,
}

impl ExecutionHandle {
    /// Blocks until the execution finishes; returns the terminal status.
    pub fn wait(&mut self) -> ErrorCode {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("background execution worker panicked");
            }
        }
        self.engine.inner.terminal.wait_without_fence().status
    }

    /// Non-blocking finish check.
    pub fn is_finished(&self) -> bool {
        self.engine.is_finished()
    }

    /// Classification of the finished execution.
    pub fn status(&self) -> Result<Completion, EngineError> {
        self.engine.completed_with()
    }

    /// Launched timing as last reported by a driver (µs).
    pub fn timing(&self) -> Timing {
        match self.engine.inner.timing.lock() {
            Ok(t) => *t,
            Err(p) => *p.into_inner(),
        }
    }

    /// The underlying engine, for terminal queries.
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }
}

// ── Step loop ──────────────────────────────────────────────────

fn run_plan_loop(inner: &EngineInner, args: ExecutionArgs) {
    let compilation = Arc::clone(&inner.compilation);
    let plan = compilation.plan();
    let mut controller = compilation.make_controller();
    let mut temporaries = DynamicTemporaryTable::from_plan(plan);
    let staging = StagingPool::new(inner.staging_budget);
    let mut output_shapes = initial_output_shapes_from(&args.outputs);
    let mut timing = Timing::unavailable();
    // The trivial CPU plan has nowhere to fall.
    let allow_fallback = args.allow_cpu_fallback && !plan.is_simple_cpu();
    let mut retry_same_step = false;

    'steps: loop {
        let tick = if retry_same_step {
            controller.fallback(args.deadline)
        } else {
            controller.next(args.deadline)
        };
        retry_same_step = false;

        let step = match tick {
            Err(code) => {
                // A deadline miss from the plan interpreter is
                // authoritative: no fallback.
                if allow_fallback && !code.is_deadline_miss() {
                    break 'steps;
                }
                publish_without_fence(inner, &args, code, Vec::new(), Timing::unavailable());
                return;
            }
            Ok(Tick::Done) => {
                publish_without_fence(inner, &args, ErrorCode::NoError, output_shapes, timing);
                return;
            }
            Ok(Tick::Step(step)) => step,
        };

        let step_is_cpu = step.is_cpu();
        let burst = controller.burst_for(&step);
        let executor = match StepExecutor::for_step(
            &step,
            &args,
            &mut temporaries,
            &staging,
            compilation.cpu_device(),
            &inner.timing,
        ) {
            Ok(executor) => executor,
            Err(err) => {
                tracing::warn!(step = step.index, "failed to materialise step: {err}");
                if allow_fallback {
                    break 'steps;
                }
                publish_without_fence(inner, &args, err.code(), Vec::new(), Timing::unavailable());
                return;
            }
        };

        tracing::debug!(step = step.index, device = step.device.name(), "running step");
        let outcome = executor.compute(args.deadline, burst.as_ref());
        let mut step_code = outcome.code;
        let flags = match executor.update_output_shapes(
            step_code,
            &outcome.shapes,
            &mut output_shapes,
            &mut temporaries,
        ) {
            Ok(flags) => flags,
            Err(err) => {
                tracing::warn!(step = step.index, "shape propagation failed: {err}");
                step_code = ErrorCode::OpFailed;
                UpdateFlags::default()
            }
        };

        if step_code == ErrorCode::NoError {
            if flags.zero_sized_input {
                tracing::debug!(step = step.index, "zero-sized downstream input");
                step_code = ErrorCode::OpFailed;
            } else {
                debug_assert!(executor.dynamic_temporaries_allocated(&temporaries));
                // Timing is only meaningful for single-step plans, so
                // keeping the last step's is enough.
                timing = outcome.timing;
                continue 'steps;
            }
        }

        if step_code == ErrorCode::OutputInsufficientSize {
            if flags.main_output_insufficient || !flags.updated_dynamic_temporary {
                // Nothing left to widen: surface the learned shapes.
                publish_without_fence(
                    inner,
                    &args,
                    step_code,
                    output_shapes,
                    Timing::unavailable(),
                );
                return;
            }
            retry_same_step = true;
            continue 'steps;
        }

        if step_code.is_deadline_miss() {
            publish_without_fence(inner, &args, step_code, Vec::new(), Timing::unavailable());
            return;
        }

        if !allow_fallback {
            publish_without_fence(inner, &args, step_code, Vec::new(), Timing::unavailable());
            return;
        }

        if step_is_cpu {
            // The CPU already failed; only a full fallback of a
            // non-simple plan can make progress.
            if !plan.is_simple() {
                break 'steps;
            }
            publish_without_fence(inner, &args, step_code, Vec::new(), Timing::unavailable());
            return;
        }

        if flags.zero_sized_input {
            // Partial fallback would re-encounter the same input.
            break 'steps;
        }

        // Partial fallback: retry the failing step on the CPU.
        tracing::debug!(step = step.index, "partial CPU fallback");
        let mut escalate_full = false;
        loop {
            let fallback_step = match controller.fallback(args.deadline) {
                Err(code) => {
                    if code.is_deadline_miss() || plan.is_simple() {
                        publish_without_fence(
                            inner,
                            &args,
                            code,
                            Vec::new(),
                            Timing::unavailable(),
                        );
                        return;
                    }
                    escalate_full = true;
                    break;
                }
                Ok(Tick::Step(step)) => step,
                Ok(Tick::Done) => {
                    escalate_full = true;
                    break;
                }
            };
            let mut fallback_executor = match StepExecutor::for_step(
                &fallback_step,
                &args,
                &mut temporaries,
                &staging,
                compilation.cpu_device(),
                &inner.timing,
            ) {
                Ok(executor) => executor,
                Err(err) => {
                    tracing::warn!("failed to materialise fallback step: {err}");
                    escalate_full = true;
                    break;
                }
            };
            let fallback_outcome = fallback_executor.compute_on_cpu_fallback();
            let mut fallback_code = fallback_outcome.code;
            let fallback_flags = match fallback_executor.update_output_shapes(
                fallback_code,
                &fallback_outcome.shapes,
                &mut output_shapes,
                &mut temporaries,
            ) {
                Ok(flags) => flags,
                Err(err) => {
                    tracing::warn!("fallback shape propagation failed: {err}");
                    fallback_code = ErrorCode::OpFailed;
                    UpdateFlags::default()
                }
            };

            if fallback_code == ErrorCode::NoError {
                if fallback_flags.zero_sized_input {
                    escalate_full = true;
                    break;
                }
                debug_assert!(fallback_executor.dynamic_temporaries_allocated(&temporaries));
                timing = fallback_outcome.timing;
                // Fallback succeeded: resume the outer loop at the top.
                break;
            }

            if fallback_code == ErrorCode::OutputInsufficientSize {
                if fallback_flags.main_output_insufficient
                    || !fallback_flags.updated_dynamic_temporary
                {
                    publish_without_fence(
                        inner,
                        &args,
                        fallback_code,
                        output_shapes,
                        Timing::unavailable(),
                    );
                    return;
                }
                // Widened a temporary: retry the CPU attempt.
                continue;
            }

            if fallback_code.is_deadline_miss() || plan.is_simple() {
                publish_without_fence(
                    inner,
                    &args,
                    fallback_code,
                    Vec::new(),
                    Timing::unavailable(),
                );
                return;
            }

            escalate_full = true;
            break;
        }
        if escalate_full {
            break 'steps;
        }
    }

    // A potentially recoverable error occurred; run the whole model on
    // the CPU instead.
    tracing::debug!("full CPU fallback");
    let mut executor = StepExecutor::full_fallback(
        compilation.main_model(),
        &args,
        compilation.cpu_device(),
        &inner.timing,
    );
    let outcome = executor.compute_on_cpu_fallback();
    let mut code = outcome.code;
    let mut shapes = initial_output_shapes_from(&args.outputs);
    if let Err(err) =
        executor.update_output_shapes(code, &outcome.shapes, &mut shapes, &mut temporaries)
    {
        tracing::warn!("full-fallback shape propagation failed: {err}");
        code = ErrorCode::OpFailed;
    }
    publish_without_fence(inner, &args, code, shapes, outcome.timing);
}

fn run_fenced_loop(
    inner: &EngineInner,
    args: &ExecutionArgs,
    wait_for: Vec<SyncFence>,
    timeout_after_fence: Option<Duration>,
) -> (ErrorCode, Option<SyncFence>, Option<Arc<dyn FencedCallback>>) {
    let compilation = Arc::clone(&inner.compilation);
    let plan = compilation.plan();
    let mut controller = compilation.make_controller();
    let mut temporaries = DynamicTemporaryTable::from_plan(plan);
    let staging = StagingPool::new(inner.staging_budget);
    let allow_fallback = args.allow_cpu_fallback && !plan.is_simple_cpu();

    let mut wait_fences = wait_for.clone();
    let mut sync_fence: Option<SyncFence> = None;
    let mut callback: Option<Arc<dyn FencedCallback>> = None;

    'steps: loop {
        let step = match controller.next(args.deadline) {
            Err(code) => {
                if allow_fallback && !code.is_deadline_miss() {
                    break 'steps;
                }
                return (code, None, None);
            }
            Ok(Tick::Done) => {
                if sync_fence.is_none() {
                    // Every step completed synchronously.
                    publish_without_fence(
                        inner,
                        args,
                        ErrorCode::NoError,
                        Vec::new(),
                        Timing::unavailable(),
                    );
                }
                return (ErrorCode::NoError, sync_fence, callback);
            }
            Ok(Tick::Step(step)) => step,
        };

        let step_is_cpu = step.is_cpu();
        let executor = match StepExecutor::for_step(
            &step,
            args,
            &mut temporaries,
            &staging,
            compilation.cpu_device(),
            &inner.timing,
        ) {
            Ok(executor) => executor,
            Err(err) => {
                tracing::warn!(step = step.index, "failed to materialise step: {err}");
                if allow_fallback {
                    break 'steps;
                }
                return (err.code(), None, None);
            }
        };

        tracing::debug!(step = step.index, device = step.device.name(), "running fenced step");
        let (code, fence, step_callback) =
            executor.compute_fenced(&wait_fences, timeout_after_fence, args.deadline);

        // The produced fence is the next step's wait list.
        sync_fence = fence.clone();
        callback = step_callback;
        wait_fences = match fence {
            Some(fence) => vec![fence],
            None => Vec::new(),
        };

        if code == ErrorCode::NoError {
            continue 'steps;
        }
        if code.is_deadline_miss() || !allow_fallback {
            return (code, None, None);
        }
        if step_is_cpu {
            if !plan.is_simple() {
                break 'steps;
            }
            return (code, None, None);
        }
        break 'steps;
    }

    // Full fallback: the CPU path is synchronous, so honor the caller's
    // fences by blocking on them first.
    tracing::debug!("fenced execution: full CPU fallback");
    if let Err(code) = wait_for_all(&wait_for) {
        return (code, None, None);
    }
    let mut executor = StepExecutor::full_fallback(
        compilation.main_model(),
        args,
        compilation.cpu_device(),
        &inner.timing,
    );
    let outcome = executor.compute_on_cpu_fallback();
    let mut code = outcome.code;
    let mut shapes = initial_output_shapes_from(&args.outputs);
    if let Err(err) =
        executor.update_output_shapes(code, &outcome.shapes, &mut shapes, &mut temporaries)
    {
        tracing::warn!("full-fallback shape propagation failed: {err}");
        code = ErrorCode::OpFailed;
    }
    publish_without_fence(inner, args, code, shapes, outcome.timing);
    (code, None, None)
}

// ── Publication ────────────────────────────────────────────────

fn publish_without_fence(
    inner: &EngineInner,
    args: &ExecutionArgs,
    status: ErrorCode,
    shapes: Vec<OutputShape>,
    timing: Timing,
) {
    let mut status = status;
    let main_model = inner.compilation.main_model();

    let final_shapes = if shapes.is_empty() {
        initial_output_shapes_from(&args.outputs)
    } else if !validate_final_shapes(main_model, &args.outputs, &shapes) {
        // Driver vectors were already held to the strict contract at
        // merge time; this is the last structural defense before the
        // record becomes visible.
        tracing::warn!("terminal shape vector failed validation");
        status = ErrorCode::OpFailed;
        initial_output_shapes_from(&args.outputs)
    } else {
        shapes
    };

    if !update_memories(args, &final_shapes) {
        tracing::warn!("output pool metadata update failed");
        status = ErrorCode::OpFailed;
    }

    let success = status == ErrorCode::NoError;
    for binding in &args.outputs {
        if let BindingState::Memory { pool, .. } = binding.state() {
            args.pools[*pool as usize].validator().set_initialized(success);
        }
    }

    tracing::info!(%status, "execution finished");
    inner.terminal.publish_without_fence(EngineCompletion {
        status,
        output_shapes: final_shapes,
        timing,
        mode: CompletedMode::WithoutFence,
    });
}

fn validate_final_shapes(
    model: &operand_core::ModelSpec,
    outputs: &[ArgumentBinding],
    shapes: &[OutputShape],
) -> bool {
    if shapes.len() != outputs.len() {
        return false;
    }
    for (i, (binding, shape)) in outputs.iter().zip(shapes.iter()).enumerate() {
        if !binding.dimensions().is_updatable_by(&shape.dimensions) {
            tracing::warn!("terminal shape for output {i} conflicts with its binding");
            return false;
        }
        let Some(operand) = model.output_operand(i) else {
            return false;
        };
        if operand.byte_size_of(&shape.dimensions).is_none() {
            tracing::warn!("terminal shape for output {i} overflows u32");
            return false;
        }
    }
    true
}

fn update_memories(args: &ExecutionArgs, shapes: &[OutputShape]) -> bool {
    for (i, binding) in args.outputs.iter().enumerate() {
        if let BindingState::Memory { pool, .. } = binding.state() {
            let dims = &shapes[i].dimensions;
            if !args.pools[*pool as usize].validator().update_metadata(dims) {
                return false;
            }
        }
    }
    true
}

fn register_pool(pools: &mut Vec<Arc<dyn PoolMemory>>, pool: Arc<dyn PoolMemory>) -> u32 {
    for (i, existing) in pools.iter().enumerate() {
        if Arc::ptr_eq(existing, &pool) {
            return i as u32;
        }
    }
    pools.push(pool);
    (pools.len() - 1) as u32
}
