//! Configuration structures for the dsp-runtime.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Guest runtime settings (memory source, stack ceiling, fuel)
//! - [`GuestConfig`]: Per-module settings (stack and heap budgets, entry point)
//! - [`RegionConfig`]: The fixed external memory region backing the allocator

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the dsp-runtime.
/// It can be loaded from TOML or JSON.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Guest runtime configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Module instance configuration.
    #[serde(default)]
    pub guest: GuestConfig,

    /// External memory region configuration.
    #[serde(default)]
    pub region: RegionConfig,
}

/// Where guest linear memory comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    /// Every linear memory is allocated through the aligned allocator adapter
    /// from the fixed external region.
    #[default]
    Adapter,
    /// Linear memories come from the runtime's own pre-reserved instance pool.
    Pool,
}

/// Signature of the exported entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySignature {
    /// `(input_offset: i32, output_offset: i32, count: i32)`, no results.
    #[default]
    Buffer,
    /// `(sample: f32) -> f32`, called once per sample.
    Scalar,
}

/// Guest runtime configuration.
///
/// These settings affect the whole runtime and must match between the engine
/// that precompiles a module and the engine that loads it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Source of guest linear memory.
    #[serde(default)]
    pub memory_source: MemorySource,

    /// Runtime stack limit in bytes, measured from the runtime's entry point.
    ///
    /// Bring-up lowers it to what the guest stack budget needs, so this is the
    /// ceiling a budget may reach.
    #[serde(default = "defaults::max_wasm_stack")]
    pub max_wasm_stack: usize,

    /// Fuel granted to each guest call.
    ///
    /// `None` disables fuel metering. When set, a call that runs out of fuel
    /// fails with `FuelExhausted` instead of overrunning the audio deadline.
    #[serde(default)]
    pub fuel_per_call: Option<u64>,

    /// Memory per pool slot in megabytes.
    ///
    /// Only effective with [`MemorySource::Pool`].
    #[serde(default = "defaults::pool_memory_mb")]
    pub pool_memory_mb: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_source: MemorySource::default(),
            max_wasm_stack: defaults::max_wasm_stack(),
            fuel_per_call: None,
            pool_memory_mb: defaults::pool_memory_mb(),
        }
    }
}

/// Per-module instance configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuestConfig {
    /// Guest stack budget in bytes.
    #[serde(default = "defaults::stack_budget")]
    pub stack_budget: usize,

    /// Host-managed guest heap in bytes.
    ///
    /// Zero means transient buffers are allocated through the module's own
    /// `malloc`/`free` exports, if it has them.
    #[serde(default = "defaults::heap_budget")]
    pub heap_budget: usize,

    /// Name of the exported processing function.
    #[serde(default = "defaults::entry_point")]
    pub entry_point: String,

    /// Calling convention of the entry point.
    #[serde(default)]
    pub entry_signature: EntrySignature,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            stack_budget: defaults::stack_budget(),
            heap_budget: defaults::heap_budget(),
            entry_point: defaults::entry_point(),
            entry_signature: EntrySignature::default(),
        }
    }
}

/// Fixed external memory region configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegionConfig {
    /// Region capacity in megabytes.
    #[serde(default = "defaults::capacity_mb")]
    pub capacity_mb: u32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            capacity_mb: defaults::capacity_mb(),
        }
    }
}

impl RegionConfig {
    /// Region capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        (self.capacity_mb as usize) * 1024 * 1024
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn max_wasm_stack() -> usize {
        512 * 1024
    }

    pub const fn pool_memory_mb() -> u32 {
        4
    }

    pub const fn stack_budget() -> usize {
        8192
    }

    pub const fn heap_budget() -> usize {
        16 * 1024
    }

    pub fn entry_point() -> String {
        "process".to_string()
    }

    pub const fn capacity_mb() -> u32 {
        64
    }
}
