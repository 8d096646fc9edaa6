// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Runtime configuration loaded from TOML files or built programmatically.
//!
//! # TOML Format
//! ```toml
//! staging_budget = "64M"
//! sync_exec = false
//! loop_timeout_ms = 2000
//! ```

use crate::EngineError;
use memory_manager::MemoryBudget;
use std::path::Path;
use std::time::Duration;

/// Default per-loop timeout applied to interpreted control-flow loops.
pub const DEFAULT_LOOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Hard upper bound for the loop timeout; larger requests are clamped.
pub const MAX_LOOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Runtime-level configuration shared by every execution of a process.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Staging ceiling per execution (dynamic temporaries + fallback
    /// shadows), human-readable (e.g. `"64M"`).
    pub staging_budget: String,
    /// When `true`, background computes run inline on the caller's
    /// thread instead of spawning a worker.
    #[serde(default)]
    pub sync_exec: bool,
    /// Default loop timeout in milliseconds. `None` uses
    /// [`DEFAULT_LOOP_TIMEOUT`].
    pub loop_timeout_ms: Option<u64>,
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::BadData(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, EngineError> {
        toml::from_str(toml_str)
            .map_err(|e| EngineError::BadData(format!("TOML parse error: {e}")))
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> Result<String, EngineError> {
        toml::to_string_pretty(self)
            .map_err(|e| EngineError::BadData(format!("TOML serialise error: {e}")))
    }

    /// Parses the staging budget string.
    pub fn parse_staging_budget(&self) -> Result<MemoryBudget, EngineError> {
        Ok(MemoryBudget::parse(&self.staging_budget)?)
    }

    /// Resolves the default loop timeout, clamped to [`MAX_LOOP_TIMEOUT`].
    pub fn resolve_loop_timeout(&self) -> Duration {
        let requested = self
            .loop_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LOOP_TIMEOUT);
        if requested > MAX_LOOP_TIMEOUT {
            tracing::warn!(
                "configured loop timeout {requested:?} exceeds maximum, clamping to {MAX_LOOP_TIMEOUT:?}"
            );
            MAX_LOOP_TIMEOUT
        } else {
            requested
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            staging_budget: "64M".to_string(),
            sync_exec: false,
            loop_timeout_ms: None,
        }
    }
}
