//! Hook configuration
//!
//! A [`HookConfig`] carries the construction parameters of a
//! [`crate::ProcessHook`]. It can be built in code or loaded from TOML or JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::memory::PointerChain;

/// Default refresh cadence
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 5000;

/// Default search radius for near allocations, just under the reach of a rel32 displacement
pub const DEFAULT_ALLOCATION_RADIUS: usize = 0x7FF0_0000;

/// Pointer chain rooted at the main module base
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerChainConfig {
    /// Offset from the module base to the first pointer
    pub module_offset: i64,
    /// Offsets to follow from the base pointer
    #[serde(default)]
    pub offsets: Vec<i64>,
}

impl PointerChainConfig {
    pub fn to_chain(&self) -> PointerChain {
        PointerChain::module_offset(self.module_offset, &self.offsets)
    }
}

/// Parameters of a process hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    /// Exact main window title of the target process
    pub window_title: String,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
    /// Minimum process age before attaching
    #[serde(default)]
    pub min_lifetime_ms: u64,
    /// Maximum distance between a near allocation and its reference address
    #[serde(default = "default_allocation_radius")]
    pub allocation_radius: usize,
    /// Chain whose successful resolution means the game is loaded
    #[serde(default)]
    pub loaded_pointer: Option<PointerChainConfig>,
}

fn default_refresh_interval() -> u64 {
    DEFAULT_REFRESH_INTERVAL_MS
}

fn default_allocation_radius() -> usize {
    DEFAULT_ALLOCATION_RADIUS
}

impl HookConfig {
    pub fn new(window_title: impl Into<String>) -> Self {
        Self {
            window_title: window_title.into(),
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            min_lifetime_ms: 0,
            allocation_radius: DEFAULT_ALLOCATION_RADIUS,
            loaded_pointer: None,
        }
    }

    pub fn with_refresh_interval(mut self, interval_ms: u64) -> Self {
        self.refresh_interval_ms = interval_ms;
        self
    }

    pub fn with_min_lifetime(mut self, lifetime_ms: u64) -> Self {
        self.min_lifetime_ms = lifetime_ms;
        self
    }

    pub fn with_allocation_radius(mut self, radius: usize) -> Self {
        self.allocation_radius = radius;
        self
    }

    pub fn with_loaded_pointer(mut self, module_offset: i64, offsets: &[i64]) -> Self {
        self.loaded_pointer = Some(PointerChainConfig {
            module_offset,
            offsets: offsets.to_vec(),
        });
        self
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match extension.as_deref() {
            Some("toml") => Self::from_toml_str(&source),
            Some("json") => Self::from_json_str(&source),
            _ => Err(ConfigError::Invalid(format!(
                "unknown config format: {}",
                path.display()
            ))),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_title.is_empty() {
            return Err(ConfigError::Invalid("window_title must not be empty".into()));
        }
        if self.refresh_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "refresh_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
