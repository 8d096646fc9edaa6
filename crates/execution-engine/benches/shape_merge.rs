// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Benchmarks for the between-step hot path: driver shape-vector
//! validation and dynamic-temporary redeclaration.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use device_api::{
    Device, ErrorCode, ExecutionContext, ExecutionPreference, OutputShape, PreparedModel,
    Priority, Request, StepOutcome,
};
use execution_engine::{validate_driver_shapes, DynamicTemporaryTable};
use execution_plan::{Compilation, PlanBuilder, SourceOperandIndex, StepDesc, StepOperand};
use operand_core::{Dimensions, ElementType, ModelSpec, Operand};
use std::sync::Arc;

struct NullDevice;
impl Device for NullDevice {
    fn name(&self) -> &str {
        "null"
    }
    fn prepare_model(
        &self,
        _model: &ModelSpec,
        _preference: ExecutionPreference,
        _priority: Priority,
    ) -> Result<Arc<dyn PreparedModel>, ErrorCode> {
        Ok(Arc::new(NullPrepared))
    }
}
struct NullPrepared;
impl PreparedModel for NullPrepared {
    fn execute(
        &self,
        _request: &Request,
        _burst: Option<&Arc<dyn device_api::Burst>>,
        _ctx: &ExecutionContext,
    ) -> StepOutcome {
        StepOutcome::error(ErrorCode::NoError)
    }
}

fn wide_model(outputs: usize) -> ModelSpec {
    let operands = (0..outputs)
        .map(|_| Operand::tensor(ElementType::TensorFloat32, vec![1, 0, 224, 224]))
        .collect();
    ModelSpec::new("bench", operands, vec![], (0..outputs as u32).collect()).unwrap()
}

fn temp_compilation(temps: usize) -> Arc<Compilation> {
    let model = Arc::new(
        ModelSpec::new(
            "m",
            vec![
                Operand::tensor(ElementType::TensorFloat32, vec![1]),
                Operand::tensor(ElementType::TensorFloat32, vec![1]),
            ],
            vec![0],
            vec![1],
        )
        .unwrap(),
    );
    let device: Arc<dyn Device> = Arc::new(NullDevice);
    let prepared = device
        .prepare_model(&model, Default::default(), Default::default())
        .unwrap();

    let step_model = Arc::new(
        ModelSpec::new(
            "step",
            (0..temps + 1)
                .map(|_| Operand::tensor(ElementType::TensorFloat32, vec![0]))
                .collect(),
            vec![0],
            (1..=temps as u32).collect(),
        )
        .unwrap(),
    );
    let sources: Vec<SourceOperandIndex> = (0..temps as u32)
        .map(|operand| SourceOperandIndex { model: 0, operand: operand + 10 })
        .collect();

    let mut builder = PlanBuilder::new(model);
    for source in &sources {
        builder.declare_temporary(
            *source,
            Operand::tensor(ElementType::TensorFloat32, vec![0]),
            64,
        );
    }
    builder.add_step(StepDesc {
        source_model: 0,
        step_model: Arc::clone(&step_model),
        device: Arc::clone(&device),
        prepared_model: Arc::clone(&prepared),
        inputs: vec![StepOperand::Main(0)],
        outputs: sources.iter().map(|s| StepOperand::Temporary(*s)).collect(),
        downstream_main_outputs: Vec::new(),
    });
    builder.add_step(StepDesc {
        source_model: 0,
        step_model,
        device,
        prepared_model: prepared,
        inputs: vec![StepOperand::Main(0)],
        outputs: vec![StepOperand::Main(0); temps],
        downstream_main_outputs: Vec::new(),
    });
    Arc::new(builder.build(Arc::new(NullDevice), false).unwrap())
}

fn bench_validate_shapes(c: &mut Criterion) {
    let model = wide_model(16);
    let shapes: Vec<OutputShape> = (0..16)
        .map(|_| OutputShape::sufficient(vec![1, 3, 224, 224]))
        .collect();
    c.bench_function("validate_driver_shapes_16_outputs", |b| {
        b.iter(|| {
            black_box(validate_driver_shapes(
                ErrorCode::NoError,
                black_box(&model),
                black_box(&shapes),
            ))
        })
    });
}

fn bench_redeclare(c: &mut Criterion) {
    let compilation = temp_compilation(16);
    c.bench_function("redeclare_16_temporaries", |b| {
        b.iter(|| {
            let mut table = DynamicTemporaryTable::from_plan(compilation.plan());
            for operand in 0..16u32 {
                let source = SourceOperandIndex { model: 0, operand: operand + 10 };
                table
                    .redeclare(source, &Dimensions::new(vec![256]), 1024)
                    .unwrap();
            }
            black_box(table.is_empty())
        })
    });
}

criterion_group!(benches, bench_validate_shapes, bench_redeclare);
criterion_main!(benches);
