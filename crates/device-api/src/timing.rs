// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Driver-reported timing.

/// Sentinel for "no measurement available".
pub const TIMING_UNAVAILABLE: u64 = u64::MAX;

/// Timing of one driver execution, in microseconds.
///
/// Drivers report µs; the engine converts to ns at the query surface.
/// Either field may be [`TIMING_UNAVAILABLE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Timing {
    /// Time spent on the accelerator itself.
    pub on_device_us: u64,
    /// Time spent in the driver, inclusive of device time.
    pub in_driver_us: u64,
}

impl Timing {
    /// Both fields unavailable.
    pub fn unavailable() -> Self {
        Self {
            on_device_us: TIMING_UNAVAILABLE,
            in_driver_us: TIMING_UNAVAILABLE,
        }
    }

    /// A concrete measurement.
    pub fn new(on_device_us: u64, in_driver_us: u64) -> Self {
        Self {
            on_device_us,
            in_driver_us,
        }
    }

    /// Returns `true` if at least one field carries a measurement.
    pub fn is_available(&self) -> bool {
        self.on_device_us != TIMING_UNAVAILABLE || self.in_driver_us != TIMING_UNAVAILABLE
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unavailable() {
        let t = Timing::default();
        assert!(!t.is_available());
        assert_eq!(t.on_device_us, TIMING_UNAVAILABLE);
    }

    #[test]
    fn test_partial_measurement_is_available() {
        let t = Timing::new(100, TIMING_UNAVAILABLE);
        assert!(t.is_available());
    }
}
