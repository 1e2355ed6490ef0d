//! Common types, errors, and utilities for dsp-runtime.
//!
//! This crate provides shared functionality used across the dsp-runtime workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for the engine, the guest and the memory region
//! - Diagnostic helpers (bounded message length, per-call log budgets)

pub mod config;
pub mod config_file;
pub mod diag;
pub mod error;

pub use config::{
    EngineConfig, EntrySignature, GuestConfig, MemorySource, RegionConfig, RuntimeConfig,
};
pub use config_file::{AudioConfig, ConfigFile, ConfigFileError};
pub use diag::{LogBudget, MAX_MESSAGE_LEN, truncate};
pub use error::{AllocError, EngineStage, RuntimeError};
