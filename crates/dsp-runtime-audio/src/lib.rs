//! Audio side of dsp-runtime.
//!
//! This crate provides the collaborators the engine is driven by:
//! - [`driver`]: a simulated audio device calling back from a dedicated thread
//! - [`signal`]: test signal sources (silence, sine, seeded noise)
//! - [`bench`]: block-processing benchmark with a real-time verdict
//!
//! # Quick Start
//!
//! ```ignore
//! use dsp_runtime_audio::{AudioBlock, DriverConfig, SignalSource, driver};
//!
//! let stream = driver::start(config, SignalSource::noise(1), move |block: &mut AudioBlock| {
//!     let (input, output) = block.mono();
//!     let _ = engine.process(input, output);
//!     block.duplicate_first_output();
//! })?;
//! let (report, _) = stream.join()?;
//! ```

pub mod bench;
pub mod driver;
pub mod signal;

pub use bench::{BenchConfig, BenchmarkReport, TimingStats, run_benchmark};
pub use driver::{AudioBlock, AudioStream, DriverConfig, DriverError, DriverReport};
pub use signal::{SignalKind, SignalSource};
