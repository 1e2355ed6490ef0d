//! Engine lifecycle: bring-up in four checked stages and reverse teardown.
//!
//! ```text
//! Uninitialized ─create─▶ RuntimeReady ─load_module─▶ ModuleLoaded
//!       ▲                                                  │
//!       │                                             instantiate
//!    destroy                                               ▼
//!       │            Ready ◀─create_exec_env─ Instantiated
//!       │              │
//!       │      resolve_entry_point
//!       │              ▼
//!       └──────── (entry point set)
//!
//! any stage failure ─▶ Failed
//! ```
//!
//! Every stage requires the state produced by the previous one, so a handle is
//! only ever populated when all handles before it are. [`AotEngine::destroy`]
//! releases whatever exists, newest first.

use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use dsp_runtime_common::{
    EngineConfig, EngineStage, EntrySignature, RuntimeConfig, RuntimeError, truncate,
};

use crate::alloc::AlignedAllocator;
use crate::heap::HeapStats;
use crate::instance::{CallMetrics, EntryPoint, ExecEnv, GuestInstance, stack_limit_for};
use crate::marshal::CallDiagnostics;
use crate::{CompiledModule, WasmEngine};

/// Lifecycle state of an [`AotEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Nothing acquired.
    Uninitialized,
    /// Guest runtime bootstrapped.
    RuntimeReady,
    /// Precompiled module loaded.
    ModuleLoaded,
    /// Module instantiated with its stack and heap.
    Instantiated,
    /// Execution environment created; entry point may be resolved.
    Ready,
    /// A stage failed; only `destroy` is allowed.
    Failed,
}

impl EngineState {
    /// Name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            EngineState::Uninitialized => "Uninitialized",
            EngineState::RuntimeReady => "RuntimeReady",
            EngineState::ModuleLoaded => "ModuleLoaded",
            EngineState::Instantiated => "Instantiated",
            EngineState::Ready => "Ready",
            EngineState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The sandboxed engine: runtime, module, instance, execution environment and
/// entry point, each owning the next.
pub struct AotEngine {
    pub(crate) state: EngineState,
    pub(crate) runtime: Option<WasmEngine>,
    pub(crate) module: Option<CompiledModule>,
    pub(crate) instance: Option<GuestInstance>,
    pub(crate) exec_env: Option<ExecEnv>,
    pub(crate) entry_point: Option<EntryPoint>,
    pub(crate) diagnostics: CallDiagnostics,
}

impl AotEngine {
    /// An empty engine in [`EngineState::Uninitialized`].
    pub fn new() -> Self {
        Self {
            state: EngineState::Uninitialized,
            runtime: None,
            module: None,
            instance: None,
            exec_env: None,
            entry_point: None,
            diagnostics: CallDiagnostics::new(),
        }
    }

    /// Run every bring-up stage for `config`, loading `image`.
    ///
    /// # Errors
    ///
    /// Returns the first stage error. The partially built engine is torn down.
    pub fn bring_up(
        config: &RuntimeConfig,
        allocator: Arc<AlignedAllocator>,
        image: &[u8],
    ) -> Result<Self, RuntimeError> {
        let mut engine = Self::new();
        engine.create(&Self::engine_config(config), allocator)?;
        engine.load_module(image)?;
        engine.instantiate(config.guest.stack_budget, config.guest.heap_budget)?;
        engine.create_exec_env(config.guest.stack_budget)?;
        engine.resolve_entry_point(&config.guest.entry_point, config.guest.entry_signature)?;
        Ok(engine)
    }

    /// Runtime settings [`AotEngine::bring_up`] uses for `config`.
    ///
    /// The stack limit is lowered to what the guest stack budget needs, with
    /// `engine.max_wasm_stack` as the ceiling. Images meant for this engine
    /// should be precompiled with the same settings.
    pub fn engine_config(config: &RuntimeConfig) -> EngineConfig {
        let limit = stack_limit_for(config.guest.stack_budget);
        EngineConfig {
            max_wasm_stack: config.engine.max_wasm_stack.min(limit),
            ..config.engine.clone()
        }
    }

    /// Bootstrap the guest runtime with all guest memory sourced through
    /// `allocator`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidState`] outside `Uninitialized`, or the
    /// bootstrap error after moving to `Failed`.
    #[instrument(skip_all, name = "engine_create")]
    pub fn create(
        &mut self,
        config: &EngineConfig,
        allocator: Arc<AlignedAllocator>,
    ) -> Result<(), RuntimeError> {
        self.expect_state(EngineStage::Runtime, EngineState::Uninitialized)?;

        let runtime = WasmEngine::new(config, allocator).map_err(|e| self.fail(EngineStage::Runtime, e))?;
        self.runtime = Some(runtime);
        self.advance(EngineState::RuntimeReady);
        Ok(())
    }

    /// Load a precompiled module image.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleLoad`] with the runtime's diagnostic text.
    #[instrument(skip_all, name = "engine_load_module", fields(bytes_len = image.len()))]
    pub fn load_module(&mut self, image: &[u8]) -> Result<(), RuntimeError> {
        self.expect_state(EngineStage::Load, EngineState::RuntimeReady)?;
        let runtime = self.runtime()?;

        let module = CompiledModule::from_precompiled(runtime.inner(), image)
            .map_err(|e| self.fail(EngineStage::Load, e))?;

        info!(
            content_hash = %module.content_hash(),
            exports = ?module.exports(),
            "Module loaded"
        );
        self.module = Some(module);
        self.advance(EngineState::ModuleLoaded);
        Ok(())
    }

    /// Instantiate the loaded module with the given stack and heap budgets.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Instantiation`] if the memory source is
    /// exhausted, the budgets are invalid, or the module's start-up traps.
    #[instrument(skip(self), name = "engine_instantiate")]
    pub fn instantiate(&mut self, stack_budget: usize, heap_budget: usize) -> Result<(), RuntimeError> {
        self.expect_state(EngineStage::Instantiate, EngineState::ModuleLoaded)?;
        let runtime = self.runtime()?;
        let module = self
            .module
            .as_ref()
            .ok_or(RuntimeError::InvalidState {
                stage: EngineStage::Instantiate,
                state: self.state.name(),
            })?;

        let instance = GuestInstance::instantiate(runtime, module, stack_budget, heap_budget)
            .map_err(|e| self.fail(EngineStage::Instantiate, e))?;

        self.instance = Some(instance);
        self.advance(EngineState::Instantiated);
        Ok(())
    }

    /// Create the execution environment.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ExecEnv`] if the stack budget is unusable.
    #[instrument(skip(self), name = "engine_create_exec_env")]
    pub fn create_exec_env(&mut self, stack_budget: usize) -> Result<(), RuntimeError> {
        self.expect_state(EngineStage::ExecEnv, EngineState::Instantiated)?;
        let runtime = self.runtime()?;

        let exec_env = ExecEnv::new(runtime, stack_budget)
            .map_err(|e| self.fail(EngineStage::ExecEnv, e))?;

        self.exec_env = Some(exec_env);
        self.advance(EngineState::Ready);
        Ok(())
    }

    /// Resolve the exported entry point. Until this succeeds the engine
    /// refuses calls.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::EntryPointNotFound`] if the export is missing or
    /// has the wrong signature. The engine moves to `Failed`.
    #[instrument(skip(self), name = "engine_resolve_entry_point")]
    pub fn resolve_entry_point(
        &mut self,
        name: &str,
        signature: EntrySignature,
    ) -> Result<(), RuntimeError> {
        self.expect_state(EngineStage::EntryPoint, EngineState::Ready)?;

        let resolved = match self.instance.as_mut() {
            Some(instance) => instance.resolve(name, signature),
            None => Err(RuntimeError::entry_point_not_found(name)),
        };
        let entry = resolved.map_err(|e| self.fail(EngineStage::EntryPoint, e))?;

        info!(name, ?signature, "Entry point resolved");
        self.entry_point = Some(entry);
        Ok(())
    }

    /// Release every acquired handle in reverse order and return to
    /// `Uninitialized`. Safe in any state and idempotent.
    pub fn destroy(&mut self) {
        if self.entry_point.take().is_some() {
            debug!("Entry point released");
        }
        if self.exec_env.take().is_some() {
            debug!("Execution environment destroyed");
        }
        if let Some(instance) = self.instance.take() {
            drop(instance);
            debug!("Instance deinstantiated");
        }
        if self.module.take().is_some() {
            debug!("Module unloaded");
        }
        if let Some(runtime) = self.runtime.take() {
            drop(runtime);
            info!("Guest runtime shut down");
        }
        self.state = EngineState::Uninitialized;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Whether the engine can serve `process` calls.
    pub fn is_ready(&self) -> bool {
        self.state == EngineState::Ready && self.entry_point.is_some()
    }

    /// Signature of the resolved entry point.
    pub fn entry_signature(&self) -> Option<EntrySignature> {
        self.entry_point.as_ref().map(EntryPoint::signature)
    }

    /// Guest heap usage, once instantiated.
    pub fn heap_stats(&self) -> Option<HeapStats> {
        self.instance.as_ref().map(GuestInstance::heap_stats)
    }

    /// Call counters, once the execution environment exists.
    pub fn metrics(&self) -> Option<CallMetrics> {
        self.exec_env.as_ref().map(ExecEnv::metrics)
    }

    /// The loaded module, if any.
    pub fn module(&self) -> Option<&CompiledModule> {
        self.module.as_ref()
    }

    /// The guest runtime, if created.
    pub fn runtime_handle(&self) -> Option<&WasmEngine> {
        self.runtime.as_ref()
    }

    fn runtime(&self) -> Result<&WasmEngine, RuntimeError> {
        self.runtime.as_ref().ok_or(RuntimeError::InvalidState {
            stage: EngineStage::Runtime,
            state: self.state.name(),
        })
    }

    fn expect_state(&self, stage: EngineStage, expected: EngineState) -> Result<(), RuntimeError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RuntimeError::InvalidState {
                stage,
                state: self.state.name(),
            })
        }
    }

    fn advance(&mut self, next: EngineState) {
        debug!(from = %self.state, to = %next, "Engine state change");
        self.state = next;
    }

    fn fail(&mut self, stage: EngineStage, err: RuntimeError) -> RuntimeError {
        error!(
            %stage,
            from = %self.state,
            error = %truncate(&err.to_string()),
            "Engine stage failed"
        );
        self.state = EngineState::Failed;
        err
    }
}

impl Default for AotEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AotEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for AotEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AotEngine")
            .field("state", &self.state)
            .field("module", &self.module)
            .field("entry_point", &self.entry_point)
            .finish_non_exhaustive()
    }
}
