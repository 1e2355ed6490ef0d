//! Sandboxed ahead-of-time WebAssembly engine for dsp-runtime.
//!
//! This crate runs one precompiled module and calls its sample-processing
//! export from a real-time audio thread:
//! - [`AlignedAllocator`]: 8-byte aligned blocks over a byte-granular [`BackingAllocator`]
//! - [`WasmEngine`]: the guest runtime, with linear memory sourced through the adapter
//! - [`AotEngine`]: checked bring-up, per-call [`AotEngine::process`] and teardown
//! - [`thread_env`]: one-shot per-thread attachment to the runtime
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           RegionAllocator ─▶ AlignedAllocator           │
//! │  (Fixed external region, shared by every guest memory)  │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                      WasmEngine                         │
//! │  - AdapterMemoryCreator or single-slot pool             │
//! │  - Stack ceiling, optional fuel                         │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                      AotEngine                          │
//! │  CompiledModule ─▶ GuestInstance ─▶ ExecEnv ─▶ Entry    │
//! │  - Guest heap for transient call buffers                │
//! │  - process(): copy in, call, copy out, release          │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod alloc;
pub mod engine;
pub mod heap;
pub mod instance;
pub mod lifecycle;
pub mod marshal;
pub mod memory;
pub mod module;
pub mod store;
pub mod thread_env;

pub use alloc::{ALIGNMENT, AlignedAllocator, BackingAllocator, REGION_HEADER, RegionAllocator};
pub use engine::WasmEngine;
pub use heap::{HeapKind, HeapStats};
pub use instance::{
    CallMetrics, ENTRY_STACK_RESERVE, EntryPoint, ExecEnv, GuestInstance, SAMPLE_WIDTH,
    stack_limit_for,
};
pub use lifecycle::{AotEngine, EngineState};
pub use memory::AdapterMemoryCreator;
pub use module::CompiledModule;
pub use store::GuestState;
