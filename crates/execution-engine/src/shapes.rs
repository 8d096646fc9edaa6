// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Shape propagation.
//!
//! After every step the engine folds the driver-reported
//! [`OutputShape`]s into the global output view and the
//! dynamic-temporary table. Drivers are held to a strict contract
//! (below); any violation is treated as `OP_FAILED` rather than risk
//! propagating a malformed shape into later bindings.

use crate::{DynamicTemporaryTable, EngineError, LENGTH_OVERFLOW_SENTINEL};
use device_api::{ErrorCode, OutputShape};
use execution_plan::ExecutionStep;
use operand_core::ModelSpec;

/// What a merge learned, aggregated for the recovery policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateFlags {
    /// At least one dynamic temporary grew or refined. The
    /// insufficient-size retry is pointless without this.
    pub updated_dynamic_temporary: bool,
    /// A main-model output came back insufficient; not recoverable by
    /// retrying the step.
    pub main_output_insufficient: bool,
    /// A step output feeding a downstream step is zero-sized. Partial
    /// fallback would re-encounter the same input, so the engine must
    /// escalate straight to full fallback.
    pub zero_sized_input: bool,
}

/// Validates a driver's shape vector against the contract:
///
/// - `NONE`: empty, or exactly `outputCount` entries, every entry
///   sufficient, and tensor-typed outputs with non-zero rank.
/// - `OUTPUT_INSUFFICIENT_SIZE`: exactly `outputCount` entries, at
///   least one insufficient.
/// - any other code: empty.
pub fn validate_driver_shapes(
    code: ErrorCode,
    model: &ModelSpec,
    shapes: &[OutputShape],
) -> bool {
    let output_count = model.output_count();
    match code {
        ErrorCode::NoError => {
            if !shapes.is_empty() && shapes.len() != output_count {
                tracing::warn!(
                    "driver returned {} shapes for {} outputs",
                    shapes.len(),
                    output_count
                );
                return false;
            }
            if shapes.iter().any(|s| !s.is_sufficient) {
                tracing::warn!("driver marked a shape insufficient on NO_ERROR");
                return false;
            }
            for (i, shape) in shapes.iter().enumerate() {
                let Some(operand) = model.output_operand(i) else {
                    return false;
                };
                if operand.is_tensor() && shape.dimensions.rank() == 0 {
                    tracing::warn!("driver reported zero rank for tensor output {i}");
                    return false;
                }
            }
            true
        }
        ErrorCode::OutputInsufficientSize => {
            if shapes.len() != output_count {
                tracing::warn!(
                    "driver returned {} shapes for {} outputs on OUTPUT_INSUFFICIENT_SIZE",
                    shapes.len(),
                    output_count
                );
                return false;
            }
            if shapes.iter().all(|s| s.is_sufficient) {
                tracing::warn!("no shape marked insufficient on OUTPUT_INSUFFICIENT_SIZE");
                return false;
            }
            true
        }
        _ => {
            if !shapes.is_empty() {
                tracing::warn!("driver returned shapes alongside {code}");
            }
            shapes.is_empty()
        }
    }
}

/// A zero-sized tensor: successfully produced, sufficient, rank known,
/// and some extent is zero.
pub fn is_zero_sized(code: ErrorCode, shape: &OutputShape) -> bool {
    code == ErrorCode::NoError
        && shape.is_sufficient
        && shape.dimensions.rank() > 0
        && shape.dimensions.has_unspecified_extent()
}

/// Folds step-reported shapes into the global output view and the
/// temporary table.
///
/// `step == None` is the trivial mapping used by whole-model execution
/// (full CPU fallback): step output `i` is main output `i`.
///
/// Any structural violation — contract breach, non-updatable
/// dimensions, u32 size overflow, non-monotone redeclaration — comes
/// back as an error the engine converts to `OP_FAILED`.
pub fn merge_step_outputs(
    code: ErrorCode,
    step: Option<&ExecutionStep>,
    model: &ModelSpec,
    from: &[OutputShape],
    to: &mut [OutputShape],
    temporaries: &mut DynamicTemporaryTable,
) -> Result<UpdateFlags, EngineError> {
    let mut flags = UpdateFlags::default();

    if !validate_driver_shapes(code, model, from) {
        return Err(EngineError::OpFailed("malformed driver shape vector".into()));
    }
    if from.is_empty() {
        return Ok(flags);
    }

    let Some(step) = step else {
        // Whole-model execution: element-wise overwrite.
        if from.len() != to.len() {
            return Err(EngineError::OpFailed("shape vector length mismatch".into()));
        }
        for (slot, shape) in to.iter_mut().zip(from.iter()) {
            if !slot.dimensions.is_updatable_by(&shape.dimensions) {
                return Err(EngineError::OpFailed(format!(
                    "driver shape {} conflicts with recorded {}",
                    shape.dimensions, slot.dimensions
                )));
            }
            *slot = shape.clone();
        }
        return Ok(flags);
    };

    for (i, shape) in from.iter().enumerate() {
        if let Some(main_index) = step.output_to_main(i) {
            let slot = to.get_mut(main_index as usize).ok_or_else(|| {
                EngineError::OpFailed(format!("main output index {main_index} out of range"))
            })?;
            if !slot.dimensions.is_updatable_by(&shape.dimensions) {
                return Err(EngineError::OpFailed(format!(
                    "step output {i} shape {} conflicts with recorded {}",
                    shape.dimensions, slot.dimensions
                )));
            }
            let operand = model.output_operand(i).ok_or_else(|| {
                EngineError::OpFailed(format!("step output {i} has no operand"))
            })?;
            if operand.byte_size_of(&shape.dimensions).is_none() {
                return Err(EngineError::OpFailed(format!(
                    "step output {i} size overflows u32"
                )));
            }
            *slot = shape.clone();
            flags.main_output_insufficient |= !shape.is_sufficient;
            if step.downstream_main_outputs.contains(&main_index) && is_zero_sized(code, shape) {
                flags.zero_sized_input = true;
            }
        } else if let Some(source) = step.output_to_temporary(i) {
            let Some((recorded_dims, recorded_length)) = temporaries.lookup(source) else {
                continue;
            };
            if !recorded_dims.is_updatable_by(&shape.dimensions) {
                return Err(EngineError::OpFailed(format!(
                    "temporary {source:?} shape {} conflicts with recorded {}",
                    shape.dimensions, recorded_dims
                )));
            }
            let actual_size = temporaries
                .operand(source)
                .and_then(|op| op.byte_size_of(&shape.dimensions))
                .ok_or_else(|| {
                    EngineError::OpFailed(format!("temporary {source:?} size overflows u32"))
                })?;

            let changed = if actual_size > 0 {
                temporaries.redeclare(source, &shape.dimensions, actual_size)?
            } else if !shape.is_sufficient {
                if recorded_length >= LENGTH_OVERFLOW_SENTINEL {
                    return Err(EngineError::OpFailed(format!(
                        "temporary {source:?} length estimate would overflow"
                    )));
                }
                temporaries.redeclare(source, &shape.dimensions, 2 * recorded_length)?
            } else {
                // Not fully specified yet marked sufficient: the only
                // legal way to get here on success is a zero-sized
                // tensor, which makes this temporary a zero-sized input
                // of some downstream step.
                if code == ErrorCode::NoError {
                    if !is_zero_sized(code, shape) {
                        return Err(EngineError::OpFailed(format!(
                            "temporary {source:?} reported sufficient but unsized"
                        )));
                    }
                    flags.zero_sized_input = true;
                }
                false
            };
            flags.updated_dynamic_temporary |= changed;
        }
    }

    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use operand_core::{Dimensions, ElementType, ModelSpec, Operand};

    fn model(outputs: usize) -> ModelSpec {
        let operands: Vec<Operand> = (0..outputs)
            .map(|_| Operand::tensor(ElementType::TensorFloat32, vec![1, 0]))
            .collect();
        ModelSpec::new("m", operands, vec![], (0..outputs as u32).collect()).unwrap()
    }

    #[test]
    fn test_none_accepts_empty_vector() {
        let m = model(2);
        assert!(validate_driver_shapes(ErrorCode::NoError, &m, &[]));
    }

    #[test]
    fn test_none_requires_full_vector_or_nothing() {
        let m = model(2);
        let one = vec![OutputShape::sufficient(vec![1, 4])];
        assert!(!validate_driver_shapes(ErrorCode::NoError, &m, &one));
    }

    #[test]
    fn test_none_rejects_insufficient_entries() {
        let m = model(1);
        let shapes = vec![OutputShape::insufficient(vec![1, 4])];
        assert!(!validate_driver_shapes(ErrorCode::NoError, &m, &shapes));
    }

    #[test]
    fn test_none_rejects_zero_rank_tensor() {
        let m = model(1);
        let shapes = vec![OutputShape::sufficient(Dimensions::unspecified())];
        assert!(!validate_driver_shapes(ErrorCode::NoError, &m, &shapes));
    }

    #[test]
    fn test_insufficient_requires_flagged_entry() {
        let m = model(1);
        let all_ok = vec![OutputShape::sufficient(vec![1, 4])];
        assert!(!validate_driver_shapes(
            ErrorCode::OutputInsufficientSize,
            &m,
            &all_ok
        ));
        let flagged = vec![OutputShape::insufficient(vec![1, 4])];
        assert!(validate_driver_shapes(
            ErrorCode::OutputInsufficientSize,
            &m,
            &flagged
        ));
    }

    #[test]
    fn test_other_codes_require_empty_vector() {
        let m = model(1);
        let shapes = vec![OutputShape::sufficient(vec![1])];
        assert!(!validate_driver_shapes(ErrorCode::OpFailed, &m, &shapes));
        assert!(validate_driver_shapes(ErrorCode::OpFailed, &m, &[]));
    }

    #[test]
    fn test_zero_sized_predicate() {
        let zero = OutputShape::sufficient(vec![4, 0]);
        assert!(is_zero_sized(ErrorCode::NoError, &zero));
        // Only success produces zero-sized tensors.
        assert!(!is_zero_sized(ErrorCode::OpFailed, &zero));
        assert!(!is_zero_sized(
            ErrorCode::NoError,
            &OutputShape::sufficient(vec![4, 4])
        ));
        assert!(!is_zero_sized(
            ErrorCode::NoError,
            &OutputShape::insufficient(vec![4, 0])
        ));
    }

    #[test]
    fn test_trivial_merge_overwrites_elementwise() {
        let m = model(2);
        let mut table = empty_table();
        let mut to = vec![
            OutputShape::sufficient(vec![1, 0]),
            OutputShape::sufficient(vec![1, 0]),
        ];
        let from = vec![
            OutputShape::sufficient(vec![1, 3]),
            OutputShape::sufficient(vec![1, 7]),
        ];
        let flags =
            merge_step_outputs(ErrorCode::NoError, None, &m, &from, &mut to, &mut table).unwrap();
        assert_eq!(to, from);
        assert!(!flags.main_output_insufficient);
    }

    #[test]
    fn test_trivial_merge_rejects_conflict() {
        let m = model(1);
        let mut table = empty_table();
        let mut to = vec![OutputShape::sufficient(vec![1, 3])];
        let from = vec![OutputShape::sufficient(vec![1, 4])];
        assert!(
            merge_step_outputs(ErrorCode::NoError, None, &m, &from, &mut to, &mut table).is_err()
        );
    }

    fn empty_table() -> DynamicTemporaryTable {
        // A plan with no temporaries gives an empty table.
        use device_api::{
            Device, ExecutionContext, ExecutionPreference, PreparedModel, Priority, Request,
            StepOutcome,
        };
        use execution_plan::Compilation;
        use std::sync::Arc;

        struct D;
        impl Device for D {
            fn name(&self) -> &str {
                "d"
            }
            fn prepare_model(
                &self,
                _m: &ModelSpec,
                _p: ExecutionPreference,
                _q: Priority,
            ) -> Result<Arc<dyn PreparedModel>, ErrorCode> {
                Ok(Arc::new(P))
            }
        }
        struct P;
        impl PreparedModel for P {
            fn execute(
                &self,
                _r: &Request,
                _b: Option<&Arc<dyn device_api::Burst>>,
                _c: &ExecutionContext,
            ) -> StepOutcome {
                StepOutcome::error(ErrorCode::NoError)
            }
        }

        let m = Arc::new(
            ModelSpec::new(
                "t",
                vec![Operand::tensor(ElementType::TensorFloat32, vec![1])],
                vec![],
                vec![0],
            )
            .unwrap(),
        );
        let d: Arc<dyn Device> = Arc::new(D);
        let p = d.prepare_model(&m, Default::default(), Default::default()).unwrap();
        let c = Compilation::simple(m, Arc::clone(&d), p, d, false).unwrap();
        DynamicTemporaryTable::from_plan(c.plan())
    }
}
