// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Example: drive a two-step plan across a flaky accelerator.
//!
//! Builds a compilation whose first partition is assigned to a demo
//! "NPU" that fails its first attempt, and shows the engine recovering
//! via partial CPU fallback while the second partition proceeds on the
//! accelerator.
//!
//! ```bash
//! cargo run -p execution-engine --example partitioned_run
//! ```

use device_api::{
    Burst, Device, ErrorCode, ExecutionContext, ExecutionPreference, HostBuffer, OutputShape,
    PreparedModel, Priority, Request, StepOutcome, Timing,
};
use execution_engine::{Completion, EngineConfig, ExecutionEngine};
use execution_plan::{Compilation, PlanBuilder, SourceOperandIndex, StepDesc, StepOperand};
use operand_core::{ElementType, ModelSpec, Operand};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A demo device: optionally fails its first N executions, then
/// reports the operand-declared shapes.
struct DemoDevice {
    name: &'static str,
    cpu: bool,
    failures_left: AtomicUsize,
}

impl DemoDevice {
    fn accelerator(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            name: "demo-npu",
            cpu: false,
            failures_left: AtomicUsize::new(failures),
        })
    }

    fn cpu() -> Arc<Self> {
        Arc::new(Self {
            name: "cpu",
            cpu: true,
            failures_left: AtomicUsize::new(0),
        })
    }
}

impl Device for DemoDevice {
    fn name(&self) -> &str {
        self.name
    }

    fn is_cpu(&self) -> bool {
        self.cpu
    }

    fn prepare_model(
        &self,
        model: &ModelSpec,
        _preference: ExecutionPreference,
        _priority: Priority,
    ) -> Result<Arc<dyn PreparedModel>, ErrorCode> {
        tracing::info!("{}: preparing {}", self.name, model.summary());
        // The first prepared model takes the injected failures with it.
        let failures = self.failures_left.swap(0, Ordering::AcqRel);
        Ok(Arc::new(DemoPrepared {
            device_name: self.name,
            shapes: (0..model.output_count())
                .filter_map(|i| model.output_operand(i))
                .map(|op| OutputShape::sufficient(op.dimensions.clone()))
                .collect(),
            failures_left: AtomicUsize::new(failures),
        }))
    }
}

struct DemoPrepared {
    device_name: &'static str,
    shapes: Vec<OutputShape>,
    failures_left: AtomicUsize,
}

impl PreparedModel for DemoPrepared {
    fn execute(
        &self,
        _request: &Request,
        _burst: Option<&Arc<dyn Burst>>,
        _ctx: &ExecutionContext,
    ) -> StepOutcome {
        if self
            .failures_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            tracing::warn!("{}: injected failure", self.device_name);
            return StepOutcome::error(ErrorCode::OpFailed);
        }
        tracing::info!("{}: executed", self.device_name);
        StepOutcome {
            code: ErrorCode::NoError,
            shapes: self.shapes.clone(),
            timing: Timing::new(120, 180),
        }
    }
}

fn stage_model(name: &str) -> Arc<ModelSpec> {
    Arc::new(
        ModelSpec::new(
            name,
            vec![
                Operand::tensor(ElementType::TensorFloat32, vec![1, 8]),
                Operand::tensor(ElementType::TensorFloat32, vec![1, 8]),
            ],
            vec![0],
            vec![1],
        )
        .unwrap(),
    )
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    // One accelerator that fails its first execution, plus the CPU.
    let npu = DemoDevice::accelerator(1);
    let cpu = DemoDevice::cpu();

    // Two partitions joined by a temporary.
    let main = stage_model("demo-main");
    let stage = stage_model("demo-stage");
    let hidden = SourceOperandIndex { model: 0, operand: 2 };

    let mut builder = PlanBuilder::new(Arc::clone(&main));
    builder.declare_temporary(
        hidden,
        Operand::tensor(ElementType::TensorFloat32, vec![1, 8]),
        32,
    );
    for (input, output) in [
        (StepOperand::Main(0), StepOperand::Temporary(hidden)),
        (StepOperand::Temporary(hidden), StepOperand::Main(0)),
    ] {
        let device: Arc<dyn Device> = Arc::clone(&npu) as Arc<dyn Device>;
        let prepared = device
            .prepare_model(&stage, ExecutionPreference::default(), Priority::default())
            .map_err(|code| anyhow::anyhow!("prepare failed: {code}"))?;
        builder.add_step(StepDesc {
            source_model: 0,
            step_model: Arc::clone(&stage),
            device,
            prepared_model: prepared,
            inputs: vec![input],
            outputs: vec![output],
            downstream_main_outputs: Vec::new(),
        });
    }
    let compilation = Arc::new(builder.build(Arc::clone(&cpu) as Arc<dyn Device>, false)?);

    // Bind, run, recover.
    let engine = ExecutionEngine::new(compilation, &EngineConfig::default())?;
    engine.set_input(0, None, Some(HostBuffer::new_zeroed(32)), 32)?;
    engine.set_output(0, None, Some(HostBuffer::new_zeroed(32)), 32)?;

    engine.compute()?;

    println!("completed: {:?}", engine.completed_with()?);
    println!("output shape: {:?}", engine.output_dimensions(0)?);
    assert_eq!(engine.completed_with()?, Completion::NoError);

    Ok(())
}
