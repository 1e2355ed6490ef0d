//! Configuration file structures for the dsp-runtime.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`AudioConfig`]: Audio block scheduling settings

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// module = "./build/module.cwasm"
///
/// [runtime.engine]
/// memory_source = "adapter"
/// fuel_per_call = 2_000_000
///
/// [runtime.guest]
/// stack_budget = 8192
/// heap_budget = 16384
/// entry_point = "process"
///
/// [runtime.region]
/// capacity_mb = 64
///
/// [audio]
/// block_size = 128
/// sample_rate = 48000
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, guest and region settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Audio configuration.
    #[serde(default)]
    pub audio: AudioConfig,

    /// Path to the precompiled module image.
    #[serde(default)]
    pub module: Option<String>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Audio block scheduling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// Samples handled per callback.
    #[serde(default = "defaults::block_size")]
    pub block_size: usize,

    /// Sample rate in Hz.
    #[serde(default = "defaults::sample_rate")]
    pub sample_rate: u32,

    /// Output channel count. Channel 0 is processed, the rest mirror it.
    #[serde(default = "defaults::channels")]
    pub channels: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            block_size: defaults::block_size(),
            sample_rate: defaults::sample_rate(),
            channels: defaults::channels(),
        }
    }
}

impl AudioConfig {
    /// Duration of one block at the configured sample rate, in microseconds.
    pub fn block_period_us(&self) -> f64 {
        (self.block_size as f64) * 1_000_000.0 / f64::from(self.sample_rate)
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub const fn block_size() -> usize {
        128
    }

    pub const fn sample_rate() -> u32 {
        48_000
    }

    pub const fn channels() -> usize {
        2
    }
}
