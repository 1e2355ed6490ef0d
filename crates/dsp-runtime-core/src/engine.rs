//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the guest runtime. It is created once during
//! initialization, before any module is loaded, and decides where guest
//! linear memory comes from:
//! - [`MemorySource::Adapter`]: every memory is a fixed block from the external
//!   region, allocated through the aligned allocator adapter
//! - [`MemorySource::Pool`]: memories come from a pre-reserved single-slot pool

use std::sync::Arc;

use tracing::{debug, info, instrument};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use dsp_runtime_common::{EngineConfig, MemorySource, RuntimeError};

use crate::alloc::AlignedAllocator;
use crate::memory::AdapterMemoryCreator;

/// The guest runtime.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Stack limit**: `max_wasm_stack` bounds every guest call
/// - **Fuel metering**: only when `fuel_per_call` is set, so a runaway guest
///   fails its call instead of overrunning the audio deadline
/// - **Memory source**: adapter-backed fixed memories (no guard pages, no
///   virtual reservation, no copy-on-write images) or the pooling allocator
///
/// Precompiled artifacts are only loadable by an engine with the same
/// configuration, so [`WasmEngine::precompile`] must be run on an engine
/// built from the same [`EngineConfig`].
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use dsp_runtime_common::EngineConfig;
/// use dsp_runtime_core::{AlignedAllocator, RegionAllocator, WasmEngine};
///
/// let region = Arc::new(RegionAllocator::new(64 * 1024 * 1024));
/// let allocator = Arc::new(AlignedAllocator::new(region));
/// let engine = WasmEngine::new(&EngineConfig::default(), allocator)?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Engine,
    config: EngineConfig,
    allocator: Arc<AlignedAllocator>,
    memory_creator: Option<Arc<AdapterMemoryCreator>>,
}

impl WasmEngine {
    /// Bootstrap the guest runtime with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    #[instrument(skip_all, fields(memory_source = ?config.memory_source))]
    pub fn new(config: &EngineConfig, allocator: Arc<AlignedAllocator>) -> Result<Self, RuntimeError> {
        if config.max_wasm_stack == 0 {
            return Err(RuntimeError::invalid_config("max_wasm_stack must be non-zero"));
        }

        let mut wasmtime_config = Config::new();

        wasmtime_config.max_wasm_stack(config.max_wasm_stack);
        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.fuel_per_call.is_some() {
            wasmtime_config.consume_fuel(true);
        }

        let memory_creator = match config.memory_source {
            MemorySource::Adapter => {
                let creator = Arc::new(AdapterMemoryCreator::new(Arc::clone(&allocator)));

                wasmtime_config.with_host_memory(creator.clone());
                // Memories are exact-size blocks in the region: bounds checks
                // are explicit and nothing is reserved beyond the block.
                wasmtime_config.memory_reservation(0);
                wasmtime_config.memory_reservation_for_growth(0);
                wasmtime_config.memory_guard_size(0);
                wasmtime_config.guard_before_linear_memory(false);
                wasmtime_config.memory_init_cow(false);

                info!("Guest memory sourced from the external region");
                Some(creator)
            }
            MemorySource::Pool => {
                let pooling_config = Self::create_pooling_config(config);

                wasmtime_config
                    .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

                info!(
                    pool_memory_mb = config.pool_memory_mb,
                    "Pooling allocator enabled"
                );
                None
            }
        };

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::runtime_init(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            max_wasm_stack = config.max_wasm_stack,
            fuel_per_call = ?config.fuel_per_call,
            "Guest runtime initialized"
        );

        Ok(Self {
            engine,
            config: config.clone(),
            allocator,
            memory_creator,
        })
    }

    /// Create pooling allocation configuration for a single module instance.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        // One module per engine
        pooling.total_core_instances(1);
        pooling.total_memories(1);
        pooling.total_tables(1);

        // Maximum size of a single memory in bytes
        let max_memory_bytes = (config.pool_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Compile WebAssembly (binary or text) into a precompiled artifact for
    /// this engine's configuration.
    ///
    /// This is the build-time half of loading; the audio path only ever
    /// deserializes the result.
    pub fn precompile(&self, wasm: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        let artifact = self.engine.precompile_module(wasm).map_err(|e| {
            RuntimeError::module_load(format!("Precompilation failed: {e}"))
        })?;

        debug!(
            wasm_len = wasm.len(),
            artifact_len = artifact.len(),
            "Module precompiled"
        );

        Ok(artifact)
    }

    /// Reserve `bytes` of growth for memories created after this call.
    ///
    /// Only meaningful with [`MemorySource::Adapter`]; pooled memories are
    /// sized by the pool.
    pub fn reserve_guest_growth(&self, bytes: usize) {
        if let Some(creator) = &self.memory_creator {
            creator.set_growth_reserve(bytes);
        }
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The allocator adapter backing this runtime.
    pub fn allocator(&self) -> &Arc<AlignedAllocator> {
        &self.allocator
    }

    /// Check if guest memory comes from the external region.
    pub fn is_adapter_backed(&self) -> bool {
        self.memory_creator.is_some()
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("memory_source", &self.config.memory_source)
            .field("max_wasm_stack", &self.config.max_wasm_stack)
            .field("fuel_per_call", &self.config.fuel_per_call)
            .finish_non_exhaustive()
    }
}
