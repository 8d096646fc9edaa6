// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The compiled plan and the compilation artifact.
//!
//! A [`CompiledPlan`] is frozen after compilation: a totally ordered
//! sequence of [`ExecutionStep`]s plus declarations for the dynamic
//! temporaries carried between them. The plan is the contract between
//! the (out-of-scope) partitioner and the execution engine; the
//! [`PlanBuilder`] checks that contract once, at assembly time.

use crate::{Controller, ExecutionStep, PlanError, SourceOperandIndex, StepOperand};
use device_api::{Device, PreparedModel};
use operand_core::{ModelSpec, Operand};
use std::collections::HashMap;
use std::sync::Arc;

/// A dynamic temporary declared by the partitioner.
#[derive(Debug, Clone)]
pub struct TemporaryDecl {
    pub source: SourceOperandIndex,
    /// The declared operand, possibly with unspecified extents.
    pub operand: Operand,
    /// The partitioner's initial byte-size estimate.
    pub initial_length: u32,
}

/// A frozen, validated execution plan.
#[derive(Debug)]
pub struct CompiledPlan {
    steps: Vec<Arc<ExecutionStep>>,
    temporaries: Vec<TemporaryDecl>,
    simple: bool,
}

impl CompiledPlan {
    /// The steps in execution order.
    pub fn steps(&self) -> &[Arc<ExecutionStep>] {
        &self.steps
    }

    /// The step at `index`.
    pub fn step(&self, index: usize) -> Option<&Arc<ExecutionStep>> {
        self.steps.get(index)
    }

    /// Declared dynamic temporaries.
    pub fn temporaries(&self) -> &[TemporaryDecl] {
        &self.temporaries
    }

    /// A trivial plan: one step, no temporaries.
    pub fn is_simple(&self) -> bool {
        self.simple
    }

    /// A trivial plan whose single step runs on the CPU device. CPU
    /// fallback is pointless for such a plan and is disabled.
    pub fn is_simple_cpu(&self) -> bool {
        self.simple && self.steps[0].is_cpu()
    }

    /// Returns `true` if some temporary's size is not known at compile
    /// time and must be learned from driver-reported shapes.
    pub fn has_dynamic_temporaries(&self) -> bool {
        self.temporaries
            .iter()
            .any(|t| t.operand.has_unspecified_dimensions())
    }

    /// One-line description for logs.
    pub fn summary(&self) -> String {
        format!(
            "plan: {} steps on [{}], {} temporaries{}",
            self.steps.len(),
            self.steps
                .iter()
                .map(|s| s.device.name())
                .collect::<Vec<_>>()
                .join(", "),
            self.temporaries.len(),
            if self.has_dynamic_temporaries() { " (dynamic)" } else { "" },
        )
    }
}

/// The immutable artifact an execution is created against: the plan,
/// the source models it references, and the device context resolved at
/// compile time.
pub struct Compilation {
    plan: CompiledPlan,
    source_models: Vec<Arc<ModelSpec>>,
    cpu_device: Arc<dyn Device>,
    explicit_single_device: bool,
}

impl std::fmt::Debug for Compilation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compilation")
            .field("plan", &self.plan)
            .field("source_models", &self.source_models)
            .field("explicit_single_device", &self.explicit_single_device)
            .finish_non_exhaustive()
    }
}

impl Compilation {
    /// The frozen plan.
    pub fn plan(&self) -> &CompiledPlan {
        &self.plan
    }

    /// The main model (source model 0).
    pub fn main_model(&self) -> &Arc<ModelSpec> {
        &self.source_models[0]
    }

    /// Source model by index.
    pub fn source_model(&self, index: u32) -> Option<&Arc<ModelSpec>> {
        self.source_models.get(index as usize)
    }

    /// The CPU device resolved for this compilation. Full and partial
    /// fallback re-prepare models here.
    pub fn cpu_device(&self) -> &Arc<dyn Device> {
        &self.cpu_device
    }

    /// Whether the compilation was created against an explicit
    /// single-device list. Timing measurement and execution timeouts
    /// are only meaningful in that case.
    pub fn explicit_single_device(&self) -> bool {
        self.explicit_single_device
    }

    /// Creates a fresh cursor over the plan for one execution.
    pub fn make_controller(self: &Arc<Self>) -> Controller {
        Controller::new(Arc::clone(self))
    }
}

// ── Builder ────────────────────────────────────────────────────

/// Descriptor for one step handed to the [`PlanBuilder`].
pub struct StepDesc {
    pub source_model: u32,
    pub step_model: Arc<ModelSpec>,
    pub device: Arc<dyn Device>,
    pub prepared_model: Arc<dyn PreparedModel>,
    pub inputs: Vec<StepOperand>,
    pub outputs: Vec<StepOperand>,
    pub downstream_main_outputs: Vec<u32>,
}

/// Assembles and validates a [`Compilation`].
///
/// Used by the partitioner and by tests. The main model is registered
/// as source model 0.
pub struct PlanBuilder {
    source_models: Vec<Arc<ModelSpec>>,
    temporaries: Vec<TemporaryDecl>,
    steps: Vec<Arc<ExecutionStep>>,
}

impl PlanBuilder {
    /// Starts a plan for `main_model`.
    pub fn new(main_model: Arc<ModelSpec>) -> Self {
        Self {
            source_models: vec![main_model],
            temporaries: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Registers an additional source model; returns its index.
    pub fn add_source_model(&mut self, model: Arc<ModelSpec>) -> u32 {
        self.source_models.push(model);
        (self.source_models.len() - 1) as u32
    }

    /// Declares a dynamic temporary.
    pub fn declare_temporary(
        &mut self,
        source: SourceOperandIndex,
        operand: Operand,
        initial_length: u32,
    ) -> &mut Self {
        self.temporaries.push(TemporaryDecl {
            source,
            operand,
            initial_length,
        });
        self
    }

    /// Appends a step. Steps execute in insertion order.
    pub fn add_step(&mut self, desc: StepDesc) -> &mut Self {
        let index = self.steps.len();
        self.steps.push(Arc::new(ExecutionStep {
            index,
            source_model: desc.source_model,
            step_model: desc.step_model,
            device: desc.device,
            prepared_model: desc.prepared_model,
            inputs: desc.inputs,
            outputs: desc.outputs,
            downstream_main_outputs: desc.downstream_main_outputs.into_iter().collect(),
        }));
        self
    }

    /// Validates and freezes the plan into a [`Compilation`].
    pub fn build(
        self,
        cpu_device: Arc<dyn Device>,
        explicit_single_device: bool,
    ) -> Result<Compilation, PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        let main = &self.source_models[0];
        let declared: HashMap<SourceOperandIndex, ()> =
            self.temporaries.iter().map(|t| (t.source, ())).collect();
        let mut producers: HashMap<SourceOperandIndex, usize> = HashMap::new();

        for step in &self.steps {
            if step.source_model as usize >= self.source_models.len() {
                return Err(PlanError::UnknownSourceModel {
                    step: step.index,
                    model: step.source_model,
                });
            }
            for (kind, list, expected, main_count) in [
                (
                    "input",
                    &step.inputs,
                    step.step_model.input_count(),
                    main.input_count(),
                ),
                (
                    "output",
                    &step.outputs,
                    step.step_model.output_count(),
                    main.output_count(),
                ),
            ] {
                if list.len() != expected {
                    return Err(PlanError::OperandCountMismatch {
                        step: step.index,
                        kind,
                        declared: list.len(),
                        expected,
                    });
                }
                for op in list {
                    match op {
                        StepOperand::Main(idx) => {
                            if *idx as usize >= main_count {
                                return Err(PlanError::MainIndexOutOfRange {
                                    step: step.index,
                                    kind,
                                    index: *idx,
                                    count: main_count,
                                });
                            }
                        }
                        StepOperand::Temporary(source) => {
                            if !declared.contains_key(source) {
                                return Err(PlanError::UnknownTemporary {
                                    step: step.index,
                                    operand: *source,
                                });
                            }
                        }
                    }
                }
            }

            for source in step.produced_temporaries() {
                if let Some(&first) = producers.get(&source) {
                    return Err(PlanError::DuplicateProducer {
                        operand: source,
                        first,
                        second: step.index,
                    });
                }
                producers.insert(source, step.index);
            }
        }

        for step in &self.steps {
            for source in step.consumed_temporaries() {
                match producers.get(&source) {
                    None => return Err(PlanError::NeverProduced { operand: source }),
                    Some(&producer) if producer >= step.index => {
                        return Err(PlanError::ConsumedBeforeProduced {
                            operand: source,
                            consumer: step.index,
                            producer,
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        for decl in &self.temporaries {
            if !producers.contains_key(&decl.source) {
                return Err(PlanError::NeverProduced { operand: decl.source });
            }
        }

        let simple = self.steps.len() == 1 && self.temporaries.is_empty();
        if !simple && self.steps.len() == 1 && !self.temporaries.is_empty() {
            return Err(PlanError::SimplePlanConstraint(
                "a single-step plan cannot carry temporaries",
            ));
        }

        let plan = CompiledPlan {
            steps: self.steps,
            temporaries: self.temporaries,
            simple,
        };
        tracing::debug!("{}", plan.summary());

        Ok(Compilation {
            plan,
            source_models: self.source_models,
            cpu_device,
            explicit_single_device,
        })
    }
}

impl Compilation {
    /// Builds the trivial compilation: the whole main model as one step
    /// on one device, inputs and outputs mapped one-to-one.
    pub fn simple(
        main_model: Arc<ModelSpec>,
        device: Arc<dyn Device>,
        prepared_model: Arc<dyn PreparedModel>,
        cpu_device: Arc<dyn Device>,
        explicit_single_device: bool,
    ) -> Result<Self, PlanError> {
        let inputs = (0..main_model.input_count() as u32)
            .map(StepOperand::Main)
            .collect();
        let outputs = (0..main_model.output_count() as u32)
            .map(StepOperand::Main)
            .collect();
        let mut builder = PlanBuilder::new(Arc::clone(&main_model));
        builder.add_step(StepDesc {
            source_model: 0,
            step_model: main_model,
            device,
            prepared_model,
            inputs,
            outputs,
            downstream_main_outputs: Vec::new(),
        });
        builder.build(cpu_device, explicit_single_device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_api::{
        ErrorCode, ExecutionContext, ExecutionPreference, Priority, Request, StepOutcome,
    };
    use operand_core::ElementType;

    struct StubDevice {
        cpu: bool,
    }
    impl Device for StubDevice {
        fn name(&self) -> &str {
            if self.cpu {
                "cpu"
            } else {
                "npu"
            }
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
            Ok(Arc::new(StubPrepared))
        }
    }
    struct StubPrepared;
    impl PreparedModel for StubPrepared {
        fn execute(
            &self,
            _request: &Request,
            _burst: Option<&Arc<dyn device_api::Burst>>,
            _ctx: &ExecutionContext,
        ) -> StepOutcome {
            StepOutcome::error(ErrorCode::NoError)
        }
    }

    fn model(ins: usize, outs: usize) -> Arc<ModelSpec> {
        let total = ins + outs;
        let operands = (0..total)
            .map(|_| Operand::tensor(ElementType::TensorFloat32, vec![1, 4]))
            .collect();
        Arc::new(
            ModelSpec::new(
                "m",
                operands,
                (0..ins as u32).collect(),
                (ins as u32..total as u32).collect(),
            )
            .unwrap(),
        )
    }

    fn devices() -> (Arc<dyn Device>, Arc<dyn Device>) {
        (
            Arc::new(StubDevice { cpu: false }),
            Arc::new(StubDevice { cpu: true }),
        )
    }

    fn prepared(device: &Arc<dyn Device>, m: &Arc<ModelSpec>) -> Arc<dyn PreparedModel> {
        device
            .prepare_model(m, ExecutionPreference::default(), Priority::default())
            .unwrap()
    }

    #[test]
    fn test_simple_compilation() {
        let m = model(1, 1);
        let (npu, cpu) = devices();
        let p = prepared(&npu, &m);
        let c = Compilation::simple(m, npu, p, cpu, false).unwrap();
        assert!(c.plan().is_simple());
        assert!(!c.plan().is_simple_cpu());
        assert!(!c.plan().has_dynamic_temporaries());
        assert_eq!(c.plan().steps().len(), 1);
    }

    #[test]
    fn test_simple_cpu_detection() {
        let m = model(1, 1);
        let (_npu, cpu) = devices();
        let p = prepared(&cpu, &m);
        let c = Compilation::simple(m, Arc::clone(&cpu), p, cpu, false).unwrap();
        assert!(c.plan().is_simple_cpu());
    }

    #[test]
    fn test_empty_plan_rejected() {
        let m = model(1, 1);
        let (_npu, cpu) = devices();
        let err = PlanBuilder::new(m).build(cpu, false).unwrap_err();
        assert!(matches!(err, PlanError::EmptyPlan));
    }

    #[test]
    fn test_two_step_plan_with_temporary() {
        let main = model(1, 1);
        let step_m = model(1, 1);
        let (npu, cpu) = devices();
        let temp = SourceOperandIndex { model: 0, operand: 9 };

        let mut b = PlanBuilder::new(Arc::clone(&main));
        b.declare_temporary(
            temp,
            Operand::tensor(ElementType::TensorFloat32, vec![0]),
            64,
        );
        b.add_step(StepDesc {
            source_model: 0,
            step_model: Arc::clone(&step_m),
            device: Arc::clone(&npu),
            prepared_model: prepared(&npu, &step_m),
            inputs: vec![StepOperand::Main(0)],
            outputs: vec![StepOperand::Temporary(temp)],
            downstream_main_outputs: Vec::new(),
        });
        b.add_step(StepDesc {
            source_model: 0,
            step_model: Arc::clone(&step_m),
            device: Arc::clone(&npu),
            prepared_model: prepared(&npu, &step_m),
            inputs: vec![StepOperand::Temporary(temp)],
            outputs: vec![StepOperand::Main(0)],
            downstream_main_outputs: Vec::new(),
        });
        let c = b.build(cpu, false).unwrap();
        assert!(!c.plan().is_simple());
        assert!(c.plan().has_dynamic_temporaries());
        assert!(c.plan().summary().contains("2 steps"));
    }

    #[test]
    fn test_undeclared_temporary_rejected() {
        let main = model(1, 1);
        let (npu, cpu) = devices();
        let temp = SourceOperandIndex { model: 0, operand: 3 };

        let mut b = PlanBuilder::new(Arc::clone(&main));
        b.add_step(StepDesc {
            source_model: 0,
            step_model: Arc::clone(&main),
            device: Arc::clone(&npu),
            prepared_model: prepared(&npu, &main),
            inputs: vec![StepOperand::Main(0)],
            outputs: vec![StepOperand::Temporary(temp)],
            downstream_main_outputs: Vec::new(),
        });
        let err = b.build(cpu, false).unwrap_err();
        assert!(matches!(err, PlanError::UnknownTemporary { .. }));
    }

    #[test]
    fn test_consumed_before_produced_rejected() {
        let main = model(1, 1);
        let (npu, cpu) = devices();
        let temp = SourceOperandIndex { model: 0, operand: 5 };

        let mut b = PlanBuilder::new(Arc::clone(&main));
        b.declare_temporary(
            temp,
            Operand::tensor(ElementType::TensorFloat32, vec![0]),
            16,
        );
        // Consumer first, producer second: invalid order.
        b.add_step(StepDesc {
            source_model: 0,
            step_model: Arc::clone(&main),
            device: Arc::clone(&npu),
            prepared_model: prepared(&npu, &main),
            inputs: vec![StepOperand::Temporary(temp)],
            outputs: vec![StepOperand::Main(0)],
            downstream_main_outputs: Vec::new(),
        });
        b.add_step(StepDesc {
            source_model: 0,
            step_model: Arc::clone(&main),
            device: Arc::clone(&npu),
            prepared_model: prepared(&npu, &main),
            inputs: vec![StepOperand::Main(0)],
            outputs: vec![StepOperand::Temporary(temp)],
            downstream_main_outputs: Vec::new(),
        });
        let err = b.build(cpu, false).unwrap_err();
        assert!(matches!(err, PlanError::ConsumedBeforeProduced { .. }));
    }

    #[test]
    fn test_operand_count_mismatch_rejected() {
        let main = model(2, 1);
        let (npu, cpu) = devices();

        let mut b = PlanBuilder::new(Arc::clone(&main));
        b.add_step(StepDesc {
            source_model: 0,
            step_model: Arc::clone(&main),
            device: Arc::clone(&npu),
            prepared_model: prepared(&npu, &main),
            inputs: vec![StepOperand::Main(0)], // model wants 2
            outputs: vec![StepOperand::Main(0)],
            downstream_main_outputs: Vec::new(),
        });
        let err = b.build(cpu, false).unwrap_err();
        assert!(matches!(err, PlanError::OperandCountMismatch { .. }));
    }

    #[test]
    fn test_main_index_out_of_range_rejected() {
        let main = model(1, 1);
        let (npu, cpu) = devices();

        let mut b = PlanBuilder::new(Arc::clone(&main));
        b.add_step(StepDesc {
            source_model: 0,
            step_model: Arc::clone(&main),
            device: Arc::clone(&npu),
            prepared_model: prepared(&npu, &main),
            inputs: vec![StepOperand::Main(7)],
            outputs: vec![StepOperand::Main(0)],
            downstream_main_outputs: Vec::new(),
        });
        let err = b.build(cpu, false).unwrap_err();
        assert!(matches!(err, PlanError::MainIndexOutOfRange { index: 7, .. }));
    }
}
