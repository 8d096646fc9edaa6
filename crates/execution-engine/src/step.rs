// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Single-step execution.
//!
//! A [`StepExecutor`] is one attempt to run one partition: it freezes
//! the step's inputs and outputs into a driver request (resolving
//! global bindings and dynamic temporaries), invokes the prepared
//! model — blocking or fenced — and reports timing to the engine's
//! side channel. Executors are single-use; a retry builds a fresh one
//! so that grown temporaries are absorbed by construction.

use crate::{
    merge_step_outputs, ArgumentBinding, BindingState, DynamicTemporaryTable, EngineError,
    UpdateFlags,
};
use device_api::{
    ArgumentLocation, Burst, Device, ErrorCode, ExecutionContext, ExecutionPreference,
    FencedCallback, HostPoolMemory, OutputShape, PoolMemory, PreparedModel, Priority, Request,
    RequestArgument, StepOutcome, SyncFence, Timing,
};
use execution_plan::{ExecutionStep, StepOperand};
use memory_manager::StagingPool;
use operand_core::ModelSpec;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Side channel the engine reads launched timing from.
pub(crate) type TimingSink = Arc<Mutex<Timing>>;

/// Immutable snapshot of the caller-visible execution arguments, taken
/// when the execution starts.
pub(crate) struct ExecutionArgs {
    pub inputs: Vec<ArgumentBinding>,
    pub outputs: Vec<ArgumentBinding>,
    pub pools: Vec<Arc<dyn PoolMemory>>,
    pub measure_timing: bool,
    pub deadline: Option<Instant>,
    pub loop_timeout: Duration,
    pub allow_cpu_fallback: bool,
}

/// One execution attempt of one partition (or, for full fallback, of
/// the whole main model).
pub struct StepExecutor {
    step: Option<Arc<ExecutionStep>>,
    model: Arc<ModelSpec>,
    device: Arc<dyn Device>,
    prepared: Option<Arc<dyn PreparedModel>>,
    inputs: Vec<RequestArgument>,
    outputs: Vec<RequestArgument>,
    pools: Vec<Arc<dyn PoolMemory>>,
    cpu_device: Arc<dyn Device>,
    measure_timing: bool,
    loop_timeout: Duration,
    timing_sink: TimingSink,
}

impl StepExecutor {
    /// Builds the executor for `step`, staging any dynamic temporaries
    /// it touches and re-materialising their bindings at the current
    /// table sizes.
    pub(crate) fn for_step(
        step: &Arc<ExecutionStep>,
        args: &ExecutionArgs,
        temporaries: &mut DynamicTemporaryTable,
        staging: &StagingPool,
        cpu_device: &Arc<dyn Device>,
        timing_sink: &TimingSink,
    ) -> Result<Self, EngineError> {
        temporaries.ensure_allocated(step, staging)?;

        let mut pools: Vec<Arc<dyn PoolMemory>> = Vec::new();
        let map = |operand: &StepOperand,
                   bindings: &[ArgumentBinding],
                   pools: &mut Vec<Arc<dyn PoolMemory>>|
         -> Result<RequestArgument, EngineError> {
            match operand {
                StepOperand::Main(index) => {
                    let binding = bindings.get(*index as usize).ok_or_else(|| {
                        EngineError::OpFailed(format!("main argument {index} out of range"))
                    })?;
                    Ok(map_binding(binding, args, pools))
                }
                StepOperand::Temporary(source) => Ok(map_temporary(*source, temporaries)),
            }
        };

        let inputs = step
            .inputs
            .iter()
            .map(|op| map(op, &args.inputs, &mut pools))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = step
            .outputs
            .iter()
            .map(|op| map(op, &args.outputs, &mut pools))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            step: Some(Arc::clone(step)),
            model: Arc::clone(&step.step_model),
            device: Arc::clone(&step.device),
            prepared: Some(Arc::clone(&step.prepared_model)),
            inputs,
            outputs,
            pools,
            cpu_device: Arc::clone(cpu_device),
            measure_timing: args.measure_timing,
            loop_timeout: args.loop_timeout,
            timing_sink: Arc::clone(timing_sink),
        })
    }

    /// Builds the whole-model executor used by full CPU fallback: every
    /// main input and output mapped one-to-one, no prepared model yet.
    pub(crate) fn full_fallback(
        main_model: &Arc<ModelSpec>,
        args: &ExecutionArgs,
        cpu_device: &Arc<dyn Device>,
        timing_sink: &TimingSink,
    ) -> Self {
        let mut pools: Vec<Arc<dyn PoolMemory>> = Vec::new();
        let inputs = args
            .inputs
            .iter()
            .map(|b| map_binding(b, args, &mut pools))
            .collect();
        let outputs = args
            .outputs
            .iter()
            .map(|b| map_binding(b, args, &mut pools))
            .collect();

        Self {
            step: None,
            model: Arc::clone(main_model),
            device: Arc::clone(cpu_device),
            prepared: None,
            inputs,
            outputs,
            pools,
            cpu_device: Arc::clone(cpu_device),
            measure_timing: args.measure_timing,
            loop_timeout: args.loop_timeout,
            timing_sink: Arc::clone(timing_sink),
        }
    }

    /// Whether this attempt runs on the CPU device.
    pub fn is_cpu(&self) -> bool {
        self.device.is_cpu()
    }

    /// Blocking execution on the step's assigned device.
    pub(crate) fn compute(
        &self,
        deadline: Option<Instant>,
        burst: Option<&Arc<dyn Burst>>,
    ) -> StepOutcome {
        self.execute_with_pools(&self.pools, deadline, burst)
    }

    /// Fenced execution. A driver that completes synchronously returns
    /// neither fence nor callback, in which case timing is reported
    /// immediately.
    pub(crate) fn compute_fenced(
        &self,
        wait_for: &[SyncFence],
        timeout_after_fence: Option<Duration>,
        deadline: Option<Instant>,
    ) -> (ErrorCode, Option<SyncFence>, Option<Arc<dyn FencedCallback>>) {
        let Some(prepared) = &self.prepared else {
            return (ErrorCode::OpFailed, None, None);
        };
        let request = self.request(&self.pools);
        let ctx = self.context(deadline);
        let outcome = prepared.execute_fenced(&request, wait_for, &ctx, timeout_after_fence);
        if outcome.fence.is_none() && outcome.callback.is_none() {
            self.report_timing(outcome.timing);
        }
        (outcome.code, outcome.fence, outcome.callback)
    }

    /// Re-prepares the model on the CPU device and executes there.
    ///
    /// Opaque device-memory pools are shadowed with host buffers for
    /// the duration of the call: inputs are copied device→host first,
    /// outputs host→device afterwards. An output pool whose shape was
    /// unknown at creation cannot be shadowed and fails the fallback.
    pub(crate) fn compute_on_cpu_fallback(&mut self) -> StepOutcome {
        tracing::debug!(model = self.model.name(), "re-preparing on CPU for fallback");
        let prepared = match self.cpu_device.prepare_model(
            &self.model,
            ExecutionPreference::FastSingleAnswer,
            Priority::Medium,
        ) {
            Ok(p) => p,
            Err(code) => return StepOutcome::error(code),
        };
        self.device = Arc::clone(&self.cpu_device);
        self.prepared = Some(prepared);

        let mut used_as_input = vec![false; self.pools.len()];
        let mut used_as_output = vec![false; self.pools.len()];
        for arg in &self.inputs {
            if let ArgumentLocation::Pool { pool, .. } = &arg.location {
                used_as_input[*pool as usize] = true;
            }
        }
        for arg in &self.outputs {
            if let ArgumentLocation::Pool { pool, .. } = &arg.location {
                used_as_output[*pool as usize] = true;
            }
        }

        let mut exec_pools = self.pools.clone();
        let mut shadows: Vec<(usize, Arc<HostPoolMemory>)> = Vec::new();
        for (i, pool) in self.pools.iter().enumerate() {
            let Some(device_buffer) = pool.device_buffer() else {
                continue;
            };
            if used_as_output[i] && pool.validator().created_with_unknown_shape() {
                tracing::warn!("CPU fallback impossible: output pool {i} has unknown shape");
                return StepOutcome::error(ErrorCode::OpFailed);
            }
            let shadow = Arc::new(HostPoolMemory::new(pool.logical_size()));
            if used_as_input[i] {
                if let Err(code) = device_buffer.copy_to_host(&shadow.buffer()) {
                    return StepOutcome::error(code);
                }
            }
            exec_pools[i] = Arc::clone(&shadow) as Arc<dyn PoolMemory>;
            shadows.push((i, shadow));
        }

        let outcome = self.execute_with_pools(&exec_pools, None, None);
        if outcome.code != ErrorCode::NoError {
            return outcome;
        }

        for (i, shadow) in &shadows {
            if !used_as_output[*i] {
                continue;
            }
            let Some(device_buffer) = self.pools[*i].device_buffer() else {
                continue;
            };
            if let Err(code) = device_buffer.copy_from_host(&shadow.buffer()) {
                return StepOutcome::error(code);
            }
        }
        outcome
    }

    /// Folds this step's reported shapes into the global view.
    pub(crate) fn update_output_shapes(
        &self,
        code: ErrorCode,
        from: &[OutputShape],
        to: &mut [OutputShape],
        temporaries: &mut DynamicTemporaryTable,
    ) -> Result<UpdateFlags, EngineError> {
        merge_step_outputs(code, self.step.as_deref(), &self.model, from, to, temporaries)
    }

    /// Whether every temporary this step consumes has finalized backing.
    pub(crate) fn dynamic_temporaries_allocated(&self, table: &DynamicTemporaryTable) -> bool {
        match &self.step {
            Some(step) => table.allocated(step),
            None => true,
        }
    }

    fn execute_with_pools(
        &self,
        pools: &[Arc<dyn PoolMemory>],
        deadline: Option<Instant>,
        burst: Option<&Arc<dyn Burst>>,
    ) -> StepOutcome {
        let Some(prepared) = &self.prepared else {
            return StepOutcome::error(ErrorCode::OpFailed);
        };
        let request = self.request(pools);
        let ctx = self.context(deadline);
        let outcome = prepared.execute(&request, burst, &ctx);
        self.report_timing(outcome.timing);
        outcome
    }

    fn request(&self, pools: &[Arc<dyn PoolMemory>]) -> Request {
        Request {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            pools: pools.to_vec(),
        }
    }

    fn context(&self, deadline: Option<Instant>) -> ExecutionContext {
        ExecutionContext {
            measure_timing: self.measure_timing,
            deadline,
            loop_timeout: Some(self.loop_timeout),
        }
    }

    fn report_timing(&self, timing: Timing) {
        if let Ok(mut sink) = self.timing_sink.lock() {
            *sink = timing;
        }
    }
}

fn map_binding(
    binding: &ArgumentBinding,
    args: &ExecutionArgs,
    pools: &mut Vec<Arc<dyn PoolMemory>>,
) -> RequestArgument {
    let location = match binding.state() {
        // Validation guarantees no UNSPECIFIED slot survives to start.
        BindingState::Unspecified | BindingState::NoValue => ArgumentLocation::NoValue,
        BindingState::Buffer { data, length } => ArgumentLocation::Buffer {
            data: data.clone(),
            length: *length,
        },
        BindingState::Memory {
            pool,
            offset,
            length,
        } => {
            let index = remap_pool(pools, &args.pools[*pool as usize]);
            ArgumentLocation::Pool {
                pool: index,
                offset: *offset,
                length: *length,
            }
        }
    };
    RequestArgument {
        location,
        dimensions: binding.dimensions().clone(),
    }
}

fn map_temporary(
    source: execution_plan::SourceOperandIndex,
    temporaries: &DynamicTemporaryTable,
) -> RequestArgument {
    match temporaries.lookup(source) {
        Some((dimensions, length)) => RequestArgument {
            location: ArgumentLocation::Buffer {
                data: temporaries.buffer(source),
                length,
            },
            dimensions: dimensions.clone(),
        },
        None => RequestArgument {
            location: ArgumentLocation::NoValue,
            dimensions: operand_core::Dimensions::unspecified(),
        },
    }
}

fn remap_pool(pools: &mut Vec<Arc<dyn PoolMemory>>, source: &Arc<dyn PoolMemory>) -> u32 {
    for (i, pool) in pools.iter().enumerate() {
        if Arc::ptr_eq(pool, source) {
            return i as u32;
        }
    }
    pools.push(Arc::clone(source));
    (pools.len() - 1) as u32
}
