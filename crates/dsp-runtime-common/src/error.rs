//! Error types for the dsp-runtime.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors for the engine lifecycle and per-call processing
//! - [`AllocError`]: Failures of the aligned allocator adapter and the guest heap
//!
//! Errors fall into two classes. Fatal errors ([`RuntimeError::is_fatal`]) happen
//! while the engine is being brought up and leave it unusable. Transient errors
//! ([`RuntimeError::is_transient`]) affect a single `process` call only.

use std::fmt;

use thiserror::Error;

/// A stage of the engine bring-up sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStage {
    /// Guest runtime bootstrap.
    Runtime,
    /// Loading the precompiled module image.
    Load,
    /// Instantiating the module.
    Instantiate,
    /// Creating the execution environment.
    ExecEnv,
    /// Resolving the exported entry point.
    EntryPoint,
}

impl fmt::Display for EngineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineStage::Runtime => write!(f, "runtime"),
            EngineStage::Load => write!(f, "load"),
            EngineStage::Instantiate => write!(f, "instantiate"),
            EngineStage::ExecEnv => write!(f, "exec-env"),
            EngineStage::EntryPoint => write!(f, "entry-point"),
        }
    }
}

/// Top-level runtime errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The guest runtime could not be bootstrapped.
    #[error("Runtime initialization failed: {reason}")]
    RuntimeInit {
        /// Description of the bootstrap failure.
        reason: String,
    },

    /// The precompiled module image was rejected.
    #[error("Module load failed: {reason}")]
    ModuleLoad {
        /// Diagnostic text from the guest toolchain.
        reason: String,
    },

    /// Instantiation of the loaded module failed.
    #[error("Instantiation failed: {reason}")]
    Instantiation {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// The execution environment could not be created.
    #[error("Execution environment creation failed: {reason}")]
    ExecEnv {
        /// Description of the failure.
        reason: String,
    },

    /// The required exported function is missing or has the wrong signature.
    #[error("Entry point not found: {name}")]
    EntryPointNotFound {
        /// The export name that was looked up.
        name: String,
    },

    /// A lifecycle stage was requested in the wrong state.
    #[error("Cannot run stage '{stage}' in state {state}")]
    InvalidState {
        /// The stage that was requested.
        stage: EngineStage,
        /// The state the engine was in.
        state: &'static str,
    },

    /// `process` was called before the entry point was resolved.
    #[error("Engine not ready: entry point is not resolved")]
    EngineNotReady,

    /// A transient guest buffer could not be allocated for one call.
    #[error("Guest allocation of {bytes} bytes failed")]
    GuestAlloc {
        /// Requested size in bytes.
        bytes: usize,
    },

    /// The guest function trapped.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Exception message reported by the guest runtime.
        message: String,
    },

    /// The guest call exhausted its per-call fuel budget.
    #[error("Fuel exhausted: per-call CPU budget exceeded")]
    FuelExhausted,

    /// Input and output buffers passed to `process` differ in length.
    #[error("Buffer length mismatch: input {input}, output {output}")]
    BufferMismatch {
        /// Input sample count.
        input: usize,
        /// Output sample count.
        output: usize,
    },

    /// The calling thread could not be attached to the guest runtime.
    #[error("Thread attach failed: {reason}")]
    ThreadAttach {
        /// Description of the attach failure.
        reason: String,
    },

    /// The allocator adapter failed.
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Allocator adapter and guest heap errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The backing memory cannot satisfy the request.
    #[error("out of memory: {requested} bytes requested")]
    Exhausted {
        /// Requested size in bytes.
        requested: usize,
    },

    /// `count * size` does not fit in `usize`.
    #[error("size overflow: {count} x {size}")]
    Overflow {
        /// Element count.
        count: usize,
        /// Element size.
        size: usize,
    },
}

impl RuntimeError {
    /// Create a new `RuntimeInit` error.
    pub fn runtime_init(reason: impl Into<String>) -> Self {
        Self::RuntimeInit {
            reason: reason.into(),
        }
    }

    /// Create a new `ModuleLoad` error.
    pub fn module_load(reason: impl Into<String>) -> Self {
        Self::ModuleLoad {
            reason: reason.into(),
        }
    }

    /// Create a new `Instantiation` error.
    pub fn instantiation(reason: impl Into<String>) -> Self {
        Self::Instantiation {
            reason: reason.into(),
        }
    }

    /// Create a new `ExecEnv` error.
    pub fn exec_env(reason: impl Into<String>) -> Self {
        Self::ExecEnv {
            reason: reason.into(),
        }
    }

    /// Create a new `EntryPointNotFound` error.
    pub fn entry_point_not_found(name: impl Into<String>) -> Self {
        Self::EntryPointNotFound { name: name.into() }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `ThreadAttach` error.
    pub fn thread_attach(reason: impl Into<String>) -> Self {
        Self::ThreadAttach {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error leaves the engine unusable.
    ///
    /// The initializing context is expected to halt on these rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RuntimeInit { .. }
                | Self::ModuleLoad { .. }
                | Self::Instantiation { .. }
                | Self::ExecEnv { .. }
                | Self::EntryPointNotFound { .. }
                | Self::Alloc(_)
                | Self::InvalidConfig { .. }
        )
    }

    /// Returns `true` if this error only affected a single `process` call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::GuestAlloc { .. } | Self::Trap { .. } | Self::FuelExhausted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::entry_point_not_found("process");
        assert_eq!(err.to_string(), "Entry point not found: process");

        let err = RuntimeError::InvalidState {
            stage: EngineStage::Instantiate,
            state: "RuntimeReady",
        };
        assert_eq!(
            err.to_string(),
            "Cannot run stage 'instantiate' in state RuntimeReady"
        );
    }

    #[test]
    fn test_error_from_alloc() {
        let alloc_err = AllocError::Exhausted { requested: 1024 };
        let runtime_err: RuntimeError = alloc_err.into();

        assert!(matches!(runtime_err, RuntimeError::Alloc(_)));
        assert!(runtime_err.is_fatal());
    }

    #[test]
    fn test_fatal_and_transient_are_disjoint() {
        let fatal = RuntimeError::module_load("bad magic");
        assert!(fatal.is_fatal());
        assert!(!fatal.is_transient());

        let transient = RuntimeError::GuestAlloc { bytes: 512 };
        assert!(transient.is_transient());
        assert!(!transient.is_fatal());

        assert!(RuntimeError::FuelExhausted.is_transient());
        assert!(RuntimeError::trap("unreachable").is_transient());
        assert!(!RuntimeError::EngineNotReady.is_transient());
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(EngineStage::Runtime.to_string(), "runtime");
        assert_eq!(EngineStage::ExecEnv.to_string(), "exec-env");
        assert_eq!(EngineStage::EntryPoint.to_string(), "entry-point");
    }
}
