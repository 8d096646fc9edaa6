// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Per-slot argument bindings.
//!
//! Each input and output of an execution occupies one
//! [`ArgumentBinding`] slot. A slot starts `Unspecified`, is bound at
//! most once while the engine is still configuring, and is immutable
//! from the moment the execution starts. All checks here are pure
//! bookkeeping; no I/O happens at binding time.
//!
//! The maximum representable length is `u32::MAX` — lengths travel to
//! drivers in 32-bit fields.

use crate::EngineError;
use device_api::{HostBuffer, IoKind, OutputShape};
use operand_core::{Dimensions, Operand};

/// Where a bound argument's data lives.
#[derive(Debug, Clone)]
pub enum BindingState {
    /// Not yet bound. Illegal once the execution has started.
    Unspecified,
    /// Bound as deliberately absent.
    NoValue,
    /// A caller-supplied host buffer. `data == None` is the
    /// size-discovery form (outputs only).
    Buffer {
        data: Option<HostBuffer>,
        length: u32,
    },
    /// A range of a registered memory pool.
    Memory { pool: u32, offset: u32, length: u32 },
}

/// One input or output slot of an execution.
#[derive(Debug, Clone)]
pub struct ArgumentBinding {
    state: BindingState,
    /// Effective dimensions: the operand's, possibly tightened by a
    /// caller override, possibly refined later by driver-reported
    /// shapes.
    dimensions: Dimensions,
    /// Output slots only: whether the bound buffer proved big enough.
    is_sufficient: bool,
}

impl ArgumentBinding {
    /// The initial, unbound slot.
    pub fn unspecified() -> Self {
        Self {
            state: BindingState::Unspecified,
            dimensions: Dimensions::unspecified(),
            is_sufficient: true,
        }
    }

    /// Returns `true` if the slot has not been bound yet.
    pub fn is_unspecified(&self) -> bool {
        matches!(self.state, BindingState::Unspecified)
    }

    /// Returns `true` if the slot is bound as having no value.
    pub fn has_no_value(&self) -> bool {
        matches!(self.state, BindingState::NoValue)
    }

    pub fn state(&self) -> &BindingState {
        &self.state
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dimensions
    }

    pub fn is_sufficient(&self) -> bool {
        self.is_sufficient
    }

    /// Bound length in bytes (0 for `NoValue`/`Unspecified`).
    pub fn length(&self) -> u32 {
        match &self.state {
            BindingState::Buffer { length, .. } => *length,
            BindingState::Memory { length, .. } => *length,
            _ => 0,
        }
    }

    /// Overwrites the recorded shape with a driver-reported one.
    pub(crate) fn record_shape(&mut self, dimensions: Dimensions, is_sufficient: bool) {
        self.dimensions = dimensions;
        self.is_sufficient = is_sufficient;
    }

    /// Binds a host buffer (or, for outputs, the null size-discovery
    /// form; for inputs, null plus an override binds no-value).
    pub fn from_buffer(
        operand: &Operand,
        override_dims: Option<&Dimensions>,
        data: Option<HostBuffer>,
        length: usize,
        io: IoKind,
    ) -> Result<Self, EngineError> {
        if io == IoKind::Input && data.is_none() && override_dims.is_none() {
            return Err(EngineError::BadData(
                "null input buffer requires a dimension override".into(),
            ));
        }
        let allow_unspecified = data.is_none() || io == IoKind::Output;
        check_dimension_override(operand, override_dims, allow_unspecified)?;

        let length = check_length(length)?;
        let dimensions = effective_dimensions(operand, override_dims);

        let state = match data {
            None if io == IoKind::Input => {
                if length != 0 {
                    return Err(EngineError::BadData(
                        "null input buffer must have zero length".into(),
                    ));
                }
                BindingState::NoValue
            }
            None => BindingState::Buffer { data: None, length },
            Some(buffer) => {
                if (length as usize) > buffer.len() {
                    return Err(EngineError::BadData(format!(
                        "length {length} exceeds buffer size {}",
                        buffer.len()
                    )));
                }
                BindingState::Buffer {
                    data: Some(buffer),
                    length,
                }
            }
        };

        Ok(Self {
            state,
            dimensions,
            is_sufficient: true,
        })
    }

    /// Binds a memory-pool range. Pool-level validation happens in the
    /// engine, which owns the pool table; this records the result.
    pub fn from_memory(
        operand: &Operand,
        override_dims: Option<&Dimensions>,
        pool: u32,
        offset: usize,
        length: usize,
        io: IoKind,
    ) -> Result<Self, EngineError> {
        check_dimension_override(operand, override_dims, io == IoKind::Output)?;
        let length = check_length(length)?;
        let offset = u32::try_from(offset)
            .map_err(|_| EngineError::BadData(format!("offset {offset} exceeds maximum")))?;

        Ok(Self {
            state: BindingState::Memory {
                pool,
                offset,
                length,
            },
            dimensions: effective_dimensions(operand, override_dims),
            is_sufficient: true,
        })
    }
}

/// Seeds the global output-shape view from the bound outputs: each
/// slot contributes its effective dimensions (empty for no-value
/// slots), all marked sufficient.
pub fn initial_output_shapes_from(outputs: &[ArgumentBinding]) -> Vec<OutputShape> {
    outputs
        .iter()
        .map(|binding| OutputShape {
            dimensions: if binding.has_no_value() {
                Dimensions::unspecified()
            } else {
                binding.dimensions().clone()
            },
            is_sufficient: true,
        })
        .collect()
}

fn check_length(length: usize) -> Result<u32, EngineError> {
    u32::try_from(length)
        .map_err(|_| EngineError::BadData(format!("length {length} exceeds maximum")))
}

fn effective_dimensions(operand: &Operand, override_dims: Option<&Dimensions>) -> Dimensions {
    match override_dims {
        Some(dims) if !dims.is_empty() => dims.clone(),
        _ => operand.dimensions.clone(),
    }
}

/// Validates a caller dimension override against the declared operand.
///
/// With an override: the override must be fully specified unless
/// `allow_unspecified`; a rank-bearing operand requires a matching
/// rank; a concrete extent may never be contradicted. Without one: a
/// tensor operand with unspecified dimensions requires
/// `allow_unspecified`.
pub fn check_dimension_override(
    operand: &Operand,
    override_dims: Option<&Dimensions>,
    allow_unspecified: bool,
) -> Result<(), EngineError> {
    match override_dims {
        Some(dims) => {
            if !operand.is_tensor() {
                if dims.rank() != 0 {
                    return Err(EngineError::BadData(
                        "dimension override on a scalar operand".into(),
                    ));
                }
                return Ok(());
            }
            if !allow_unspecified && (dims.is_empty() || dims.has_unspecified_extent()) {
                return Err(EngineError::BadData(
                    "dimension override is not fully specified".into(),
                ));
            }
            if operand.dimensions.is_empty() {
                return Ok(());
            }
            if operand.dimensions.rank() != dims.rank() {
                return Err(EngineError::BadData(format!(
                    "override rank {} conflicts with declared rank {}",
                    dims.rank(),
                    operand.dimensions.rank()
                )));
            }
            if !operand.dimensions.is_updatable_by(dims) {
                return Err(EngineError::BadData(
                    "override contradicts a fully specified dimension".into(),
                ));
            }
            Ok(())
        }
        None => {
            if !allow_unspecified && operand.has_unspecified_dimensions() {
                return Err(EngineError::BadData(
                    "operand type is not fully specified".into(),
                ));
            }
            Ok(())
        }
    }
}
