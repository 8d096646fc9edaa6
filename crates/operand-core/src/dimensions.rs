// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Dimension vectors and the updatability partial order.
//!
//! A [`Dimensions`] value describes the extents of a tensor operand.
//! An extent of `0` means "unspecified": the size along that axis is
//! not yet known. An empty vector means the *rank* itself is unknown
//! (for tensors) or that the operand is a scalar.
//!
//! Dimension knowledge only ever grows. The ordering is captured by
//! [`Dimensions::is_updatable_by`]: `a` may be replaced by `b` when `b`
//! is at least as specific as `a`. Fully specified vectors are the
//! maximal elements of this order, which is what bounds the number of
//! shape refinements a single execution can go through.

use std::fmt;

/// Ordered extents of a tensor operand. `0` denotes an unspecified extent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Dimensions {
    dims: Vec<u32>,
}

impl Dimensions {
    /// Creates a dimension vector from explicit extents.
    ///
    /// # Examples
    /// ```
    /// use operand_core::Dimensions;
    /// let d = Dimensions::new(vec![1, 3, 224, 224]);
    /// assert_eq!(d.rank(), 4);
    /// assert!(d.is_fully_specified());
    /// ```
    pub fn new(dims: Vec<u32>) -> Self {
        Self { dims }
    }

    /// Creates an empty vector: unknown rank (tensor) or scalar.
    pub fn unspecified() -> Self {
        Self { dims: Vec::new() }
    }

    /// Returns the number of axes. Zero for scalars and unknown-rank tensors.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns `true` if no rank has been declared.
    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// Returns the extents as a slice.
    pub fn as_slice(&self) -> &[u32] {
        &self.dims
    }

    /// Returns `true` if the rank is known and every extent is non-zero.
    pub fn is_fully_specified(&self) -> bool {
        !self.dims.is_empty() && self.dims.iter().all(|&d| d != 0)
    }

    /// Returns `true` if some extent is declared but zero-valued,
    /// i.e. the vector names an axis whose size is still unknown.
    pub fn has_unspecified_extent(&self) -> bool {
        self.dims.iter().any(|&d| d == 0)
    }

    /// Returns `true` if `self` may be overwritten by `from`.
    ///
    /// `from` must be no less specific: either `self` has no declared
    /// rank at all, or the ranks match and every extent of `self` is
    /// equal to the corresponding extent of `from` or still `0`.
    pub fn is_updatable_by(&self, from: &Dimensions) -> bool {
        if self.dims.is_empty() {
            return true;
        }
        if self.dims.len() != from.dims.len() {
            return false;
        }
        self.dims
            .iter()
            .zip(from.dims.iter())
            .all(|(&to, &from)| to == from || to == 0)
    }

    /// Total number of elements, or `None` on multiply overflow.
    ///
    /// A vector with an unspecified extent has zero elements; an empty
    /// vector counts as a single (scalar) element.
    pub fn num_elements(&self) -> Option<u64> {
        if self.dims.is_empty() {
            return Some(1);
        }
        self.dims
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(u64::from(d)))
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<u32>> for Dimensions {
    fn from(dims: Vec<u32>) -> Self {
        Self::new(dims)
    }
}

impl From<&[u32]> for Dimensions {
    fn from(dims: &[u32]) -> Self {
        Self::new(dims.to_vec())
    }
}
