//! Module instance, entry point and execution environment.
//!
//! This module provides:
//! - [`GuestInstance`]: the store, instance, linear memory and guest heap of the
//!   single loaded module
//! - [`EntryPoint`]: the resolved exported function in one of two signatures
//! - [`ExecEnv`]: per-call execution context (stack budget, fuel, scratch space)

use tracing::{debug, instrument, warn};
use wasmtime::{Instance, Linker, Memory, Store, Trap, TypedFunc};

use dsp_runtime_common::{EntrySignature, RuntimeError, truncate};

use crate::heap::{GuestHeap, HeapStats, growth_for_heap};
use crate::store::{GuestState, create_store, fuel_consumed, refuel};
use crate::{CompiledModule, WasmEngine};

/// Size of one sample in guest memory.
pub const SAMPLE_WIDTH: usize = size_of::<f32>();

/// Name of the memory export used for buffer calls.
const MEMORY_EXPORT: &str = "memory";

/// Stack the runtime spends between its entry point and the guest's first
/// frame. The runtime limit is measured from that entry point.
pub const ENTRY_STACK_RESERVE: usize = 16 * 1024;

/// Runtime stack limit that holds guest calls to `stack_budget` bytes.
pub const fn stack_limit_for(stack_budget: usize) -> usize {
    stack_budget.saturating_add(ENTRY_STACK_RESERVE)
}

/// The instantiated module and everything it owns.
pub struct GuestInstance {
    store: Store<GuestState>,
    instance: Instance,
    memory: Option<Memory>,
    heap: GuestHeap,
    stack_budget: usize,
}

impl GuestInstance {
    /// Instantiate `module` with no host imports.
    ///
    /// # Arguments
    ///
    /// * `engine` - The guest runtime the module was loaded into
    /// * `module` - The loaded module
    /// * `stack_budget` - Guest stack budget in bytes; the runtime's
    ///   `max_wasm_stack` must be `stack_limit_for(stack_budget)`
    /// * `heap_budget` - Size of the host-managed guest heap; `0` delegates to
    ///   the module's `malloc`/`free` exports when present
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Instantiation`] if the budgets are invalid, the
    /// memory source is exhausted, or the module traps during start-up.
    #[instrument(skip(engine, module), fields(content_hash = %module.content_hash()))]
    pub fn instantiate(
        engine: &WasmEngine,
        module: &CompiledModule,
        stack_budget: usize,
        heap_budget: usize,
    ) -> Result<Self, RuntimeError> {
        check_stack_budget(engine, stack_budget).map_err(RuntimeError::instantiation)?;

        let mut store = create_store(engine)
            .map_err(|e| RuntimeError::instantiation(e.to_string()))?;
        let linker: Linker<GuestState> = Linker::new(engine.inner());

        engine.reserve_guest_growth(growth_for_heap(heap_budget));
        let instance = linker.instantiate(&mut store, module.inner());
        engine.reserve_guest_growth(0);

        let instance = instance.map_err(|e| {
            RuntimeError::instantiation(truncate(&format!("{e:#}")).to_string())
        })?;

        let memory = instance.get_memory(&mut store, MEMORY_EXPORT);
        let heap = GuestHeap::setup(&mut store, &instance, memory, heap_budget)?;

        debug!(
            has_memory = memory.is_some(),
            memory_bytes = memory.map_or(0, |m| m.data_size(&store)),
            heap = %heap.stats().kind,
            "Module instantiated"
        );

        Ok(Self {
            store,
            instance,
            memory,
            heap,
            stack_budget,
        })
    }

    /// Look up the exported entry point `name` with the given signature.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::EntryPointNotFound`] if the export is missing or
    /// has a different signature, and [`RuntimeError::InvalidConfig`] if a
    /// buffer entry point is requested from a module without linear memory.
    pub fn resolve(
        &mut self,
        name: &str,
        signature: EntrySignature,
    ) -> Result<EntryPoint, RuntimeError> {
        if self.instance.get_func(&mut self.store, name).is_none() {
            return Err(RuntimeError::entry_point_not_found(name));
        }

        let entry = match signature {
            EntrySignature::Buffer => {
                if self.memory.is_none() {
                    return Err(RuntimeError::invalid_config(format!(
                        "buffer entry point '{name}' needs an exported '{MEMORY_EXPORT}'"
                    )));
                }
                self.instance
                    .get_typed_func::<(u32, u32, u32), ()>(&mut self.store, name)
                    .map(EntryPoint::Buffer)
            }
            EntrySignature::Scalar => self
                .instance
                .get_typed_func::<f32, f32>(&mut self.store, name)
                .map(EntryPoint::Scalar),
        };

        entry.map_err(|e| {
            warn!(name, ?signature, error = %e, "Export has the wrong signature");
            RuntimeError::entry_point_not_found(name)
        })
    }

    /// Guest heap usage.
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Current linear memory size in bytes (`0` without a memory export).
    pub fn memory_size(&self) -> usize {
        self.memory.map_or(0, |m| m.data_size(&self.store))
    }

    /// Stack budget the instance was created with.
    pub fn stack_budget(&self) -> usize {
        self.stack_budget
    }

    pub(crate) fn alloc(&mut self, bytes: usize) -> Option<u32> {
        self.heap.alloc(&mut self.store, bytes)
    }

    pub(crate) fn free(&mut self, offset: u32) {
        self.heap.free(&mut self.store, offset);
    }

    pub(crate) fn refuel(&mut self, fuel: Option<u64>) -> Result<(), RuntimeError> {
        match fuel {
            Some(fuel) => refuel(&mut self.store, fuel),
            None => Ok(()),
        }
    }

    /// Fuel the last call spent out of `granted`, when metering is on.
    pub(crate) fn fuel_consumed(&self, granted: u64) -> Option<u64> {
        fuel_consumed(&self.store, granted)
    }

    /// Copy `samples` into guest memory at `offset`.
    pub(crate) fn write_samples(&mut self, offset: u32, samples: &[f32]) -> Result<(), RuntimeError> {
        let dst = self.guest_slice(offset, samples.len())?;
        for (chunk, sample) in dst.chunks_exact_mut(SAMPLE_WIDTH).zip(samples) {
            chunk.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(())
    }

    /// Copy `out.len()` samples out of guest memory at `offset`.
    pub(crate) fn read_samples(&mut self, offset: u32, out: &mut [f32]) -> Result<(), RuntimeError> {
        let src = self.guest_slice(offset, out.len())?;
        for (sample, chunk) in out.iter_mut().zip(src.chunks_exact(SAMPLE_WIDTH)) {
            let mut bytes = [0u8; SAMPLE_WIDTH];
            bytes.copy_from_slice(chunk);
            *sample = f32::from_le_bytes(bytes);
        }
        Ok(())
    }

    fn guest_slice(&mut self, offset: u32, samples: usize) -> Result<&mut [u8], RuntimeError> {
        let memory = self
            .memory
            .ok_or_else(|| RuntimeError::invalid_config("module has no linear memory"))?;
        let start = offset as usize;
        let end = start + samples * SAMPLE_WIDTH;

        memory
            .data_mut(&mut self.store)
            .get_mut(start..end)
            .ok_or_else(|| {
                RuntimeError::trap(format!(
                    "guest buffer {start:#x}..{end:#x} is outside linear memory"
                ))
            })
    }

    pub(crate) fn call_buffer(
        &mut self,
        func: &TypedFunc<(u32, u32, u32), ()>,
        input: u32,
        output: u32,
        count: u32,
    ) -> Result<(), RuntimeError> {
        func.call(&mut self.store, (input, output, count))
            .map_err(call_error)
    }

    pub(crate) fn call_scalar(
        &mut self,
        func: &TypedFunc<f32, f32>,
        sample: f32,
    ) -> Result<f32, RuntimeError> {
        func.call(&mut self.store, sample).map_err(call_error)
    }
}

impl std::fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("memory_size", &self.memory_size())
            .field("heap", &self.heap.stats())
            .field("stack_budget", &self.stack_budget)
            .finish_non_exhaustive()
    }
}

/// A resolved entry point.
#[derive(Clone)]
pub enum EntryPoint {
    /// `process(input_offset, output_offset, count)` over guest buffers.
    Buffer(TypedFunc<(u32, u32, u32), ()>),
    /// `process(sample) -> sample`, one call per sample.
    Scalar(TypedFunc<f32, f32>),
}

impl EntryPoint {
    /// The signature this entry point was resolved with.
    pub fn signature(&self) -> EntrySignature {
        match self {
            EntryPoint::Buffer(_) => EntrySignature::Buffer,
            EntryPoint::Scalar(_) => EntrySignature::Scalar,
        }
    }
}

impl std::fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EntryPoint").field(&self.signature()).finish()
    }
}

/// Counters kept by the execution environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallMetrics {
    /// Guest calls that completed.
    pub calls: u64,
    /// Calls that trapped or ran out of fuel.
    pub traps: u64,
    /// Calls skipped because guest buffers could not be allocated.
    pub alloc_failures: u64,
    /// Fuel used by the last completed call, when metering is on.
    pub last_fuel_consumed: Option<u64>,
}

/// Execution context for calls into the instance.
#[derive(Debug)]
pub struct ExecEnv {
    stack_budget: usize,
    fuel_per_call: Option<u64>,
    /// Staging area for scalar calls, so output is only written when every
    /// sample succeeded.
    pub(crate) scratch: Vec<f32>,
    pub(crate) metrics: CallMetrics,
}

impl ExecEnv {
    /// Create an execution context for `stack_budget` bytes of guest stack.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ExecEnv`] if the budget is zero or the runtime's
    /// stack limit does not enforce it.
    pub fn new(engine: &WasmEngine, stack_budget: usize) -> Result<Self, RuntimeError> {
        check_stack_budget(engine, stack_budget).map_err(RuntimeError::exec_env)?;

        Ok(Self {
            stack_budget,
            fuel_per_call: engine.config().fuel_per_call,
            scratch: Vec::new(),
            metrics: CallMetrics::default(),
        })
    }

    /// Guest stack budget in bytes.
    pub fn stack_budget(&self) -> usize {
        self.stack_budget
    }

    /// Fuel granted to each call, if metering is on.
    pub fn fuel_per_call(&self) -> Option<u64> {
        self.fuel_per_call
    }

    /// Call counters.
    pub fn metrics(&self) -> CallMetrics {
        self.metrics
    }
}

/// Guest calls are bounded by the runtime's stack limit, so a budget is only
/// honoured when that limit was derived from it.
fn check_stack_budget(engine: &WasmEngine, stack_budget: usize) -> Result<(), String> {
    if stack_budget == 0 {
        return Err("stack budget must be non-zero".to_string());
    }
    let limit = engine.config().max_wasm_stack;
    let required = stack_limit_for(stack_budget);
    if required > limit {
        return Err(format!(
            "stack budget of {stack_budget} bytes exceeds the runtime stack limit of {limit}"
        ));
    }
    if required < limit {
        return Err(format!(
            "runtime stack limit of {limit} bytes cannot enforce a {stack_budget} byte budget \
             (expected {required})"
        ));
    }
    Ok(())
}

/// Map a failed guest call to a per-call error.
fn call_error(error: wasmtime::Error) -> RuntimeError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => RuntimeError::FuelExhausted,
        Some(trap) => RuntimeError::trap(truncate(&trap.to_string())),
        None => RuntimeError::trap(truncate(&error.to_string())),
    }
}
