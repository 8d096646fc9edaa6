// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Operand descriptors: element types, quantization, byte sizing.

use crate::Dimensions;

/// Enumerates the element types an operand can carry.
///
/// Scalar and tensor variants are distinct: whether a descriptor is a
/// tensor is a property of its type tag, not of its dimension vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ElementType {
    /// 32-bit IEEE 754 floating point scalar.
    Float32,
    /// 32-bit signed integer scalar.
    Int32,
    /// Boolean scalar (stored as one byte).
    Bool,
    /// Tensor of 32-bit IEEE 754 floats.
    TensorFloat32,
    /// Tensor of 16-bit IEEE 754 floats.
    TensorFloat16,
    /// Tensor of 32-bit signed integers.
    TensorInt32,
    /// Tensor of asymmetrically quantised unsigned 8-bit values.
    TensorQuant8Asymm,
    /// Tensor of 8-bit booleans.
    TensorBool8,
}

impl ElementType {
    /// Returns the size of a single element in bytes.
    pub fn element_size(self) -> u32 {
        match self {
            ElementType::Float32 | ElementType::Int32 => 4,
            ElementType::Bool => 1,
            ElementType::TensorFloat32 | ElementType::TensorInt32 => 4,
            ElementType::TensorFloat16 => 2,
            ElementType::TensorQuant8Asymm | ElementType::TensorBool8 => 1,
        }
    }

    /// Returns `true` for the tensor variants.
    pub fn is_tensor(self) -> bool {
        !matches!(
            self,
            ElementType::Float32 | ElementType::Int32 | ElementType::Bool
        )
    }

    /// Returns a human-readable label.
    pub fn as_str(self) -> &'static str {
        match self {
            ElementType::Float32 => "float32",
            ElementType::Int32 => "int32",
            ElementType::Bool => "bool",
            ElementType::TensorFloat32 => "tensor.float32",
            ElementType::TensorFloat16 => "tensor.float16",
            ElementType::TensorInt32 => "tensor.int32",
            ElementType::TensorQuant8Asymm => "tensor.quant8_asymm",
            ElementType::TensorBool8 => "tensor.bool8",
        }
    }
}

/// Quantization parameters for the quantised tensor types.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

/// A declared operand: type tag, dimensions, quantization, extension marker.
///
/// A tensor with an empty dimension vector has *unknown rank*; a tensor
/// with a declared rank may still have individual `0` extents denoting
/// unknown sizes along those axes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Operand {
    pub element_type: ElementType,
    pub dimensions: Dimensions,
    pub quant: Option<QuantParams>,
    pub is_extension: bool,
}

impl Operand {
    /// Creates a tensor operand with the given extents.
    pub fn tensor(element_type: ElementType, dims: impl Into<Dimensions>) -> Self {
        Self {
            element_type,
            dimensions: dims.into(),
            quant: None,
            is_extension: false,
        }
    }

    /// Creates a scalar operand.
    pub fn scalar(element_type: ElementType) -> Self {
        Self {
            element_type,
            dimensions: Dimensions::unspecified(),
            quant: None,
            is_extension: false,
        }
    }

    /// Attaches quantization parameters.
    pub fn with_quant(mut self, scale: f32, zero_point: i32) -> Self {
        self.quant = Some(QuantParams { scale, zero_point });
        self
    }

    /// Returns `true` if this is a tensor-typed operand.
    pub fn is_tensor(&self) -> bool {
        self.element_type.is_tensor()
    }

    /// Returns `true` if this operand's shape is not fully known:
    /// a tensor with unknown rank or with at least one `0` extent.
    pub fn has_unspecified_dimensions(&self) -> bool {
        self.is_tensor()
            && (self.dimensions.is_empty() || self.dimensions.has_unspecified_extent())
    }

    /// Byte size of this operand when realised with the extents `dims`.
    ///
    /// Scalars ignore `dims`. A tensor with unknown rank or with a
    /// zero-valued extent has size 0. Returns `None` if the size does
    /// not fit in a `u32` — callers treat that as a malformed shape.
    pub fn byte_size_of(&self, dims: &Dimensions) -> Option<u32> {
        if !self.is_tensor() {
            return Some(self.element_type.element_size());
        }
        if dims.is_empty() {
            return Some(0);
        }
        let elements = dims.num_elements()?;
        let bytes = elements.checked_mul(u64::from(self.element_type.element_size()))?;
        u32::try_from(bytes).ok()
    }

    /// Byte size using the operand's own declared dimensions.
    pub fn byte_size(&self) -> Option<u32> {
        self.byte_size_of(&self.dimensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(ElementType::TensorFloat32.element_size(), 4);
        assert_eq!(ElementType::TensorFloat16.element_size(), 2);
        assert_eq!(ElementType::TensorQuant8Asymm.element_size(), 1);
        assert_eq!(ElementType::Bool.element_size(), 1);
    }

    #[test]
    fn test_is_tensor() {
        assert!(ElementType::TensorFloat32.is_tensor());
        assert!(!ElementType::Int32.is_tensor());
    }

    #[test]
    fn test_scalar_size_ignores_dims() {
        let op = Operand::scalar(ElementType::Int32);
        assert_eq!(op.byte_size_of(&Dimensions::new(vec![16])), Some(4));
    }

    #[test]
    fn test_tensor_size() {
        let op = Operand::tensor(ElementType::TensorFloat32, vec![2, 3]);
        assert_eq!(op.byte_size(), Some(24));
    }

    #[test]
    fn test_zero_extent_is_zero_sized() {
        let op = Operand::tensor(ElementType::TensorFloat32, vec![4, 0]);
        assert_eq!(op.byte_size(), Some(0));
    }

    #[test]
    fn test_unknown_rank_is_zero_sized() {
        let op = Operand::tensor(ElementType::TensorFloat32, Dimensions::unspecified());
        assert_eq!(op.byte_size(), Some(0));
    }

    #[test]
    fn test_size_overflow_detected() {
        let op = Operand::tensor(ElementType::TensorFloat32, Dimensions::unspecified());
        let dims = Dimensions::new(vec![u32::MAX, 2]);
        assert_eq!(op.byte_size_of(&dims), None);
    }

    #[test]
    fn test_unspecified_predicates() {
        let unknown_rank = Operand::tensor(ElementType::TensorFloat32, Dimensions::unspecified());
        assert!(unknown_rank.has_unspecified_dimensions());

        let partial = Operand::tensor(ElementType::TensorFloat32, vec![1, 0]);
        assert!(partial.has_unspecified_dimensions());

        let full = Operand::tensor(ElementType::TensorFloat32, vec![1, 8]);
        assert!(!full.has_unspecified_dimensions());

        // Scalars are never "unspecified".
        assert!(!Operand::scalar(ElementType::Float32).has_unspecified_dimensions());
    }

    #[test]
    fn test_with_quant() {
        let op = Operand::tensor(ElementType::TensorQuant8Asymm, vec![8]).with_quant(0.5, 128);
        let q = op.quant.unwrap();
        assert_eq!(q.scale, 0.5);
        assert_eq!(q.zero_point, 128);
    }
}
