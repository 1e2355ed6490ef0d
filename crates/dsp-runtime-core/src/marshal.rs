//! Per-call buffer marshalling.
//!
//! [`AotEngine::process`] moves one block of samples across the host/guest
//! boundary. For a buffer entry point:
//!
//! 1. allocate input and output blocks in guest memory
//! 2. copy the input in
//! 3. call `process(input_offset, output_offset, count)`
//! 4. copy the output back, only if the call succeeded
//! 5. release both blocks, whatever happened
//!
//! Failures are per call: the host output buffer is left as it was and the
//! engine stays usable.

use tracing::{info, warn};

use dsp_runtime_common::{LogBudget, RuntimeError, truncate};

use crate::instance::{EntryPoint, ExecEnv, GuestInstance, SAMPLE_WIDTH};
use crate::lifecycle::AotEngine;
use crate::thread_env;

/// Successful calls reported before going quiet.
const SUCCESS_REPORTS: u32 = 3;

/// Rate limits for diagnostics emitted on the audio path.
#[derive(Debug)]
pub(crate) struct CallDiagnostics {
    successes: LogBudget,
    not_ready: LogBudget,
    mismatch: LogBudget,
    attach: LogBudget,
    alloc: LogBudget,
    trap: LogBudget,
    fuel: LogBudget,
    other: LogBudget,
}

impl CallDiagnostics {
    pub(crate) const fn new() -> Self {
        Self {
            successes: LogBudget::new(SUCCESS_REPORTS),
            not_ready: LogBudget::new(1),
            mismatch: LogBudget::new(1),
            attach: LogBudget::new(1),
            alloc: LogBudget::new(1),
            trap: LogBudget::new(1),
            fuel: LogBudget::new(1),
            other: LogBudget::new(1),
        }
    }

    fn success(&self, samples: usize) {
        if self.successes.allow() {
            info!(samples, "Guest process call succeeded");
        }
    }

    fn failure(&self, err: &RuntimeError) {
        let budget = match err {
            RuntimeError::EngineNotReady => &self.not_ready,
            RuntimeError::BufferMismatch { .. } => &self.mismatch,
            RuntimeError::ThreadAttach { .. } => &self.attach,
            RuntimeError::GuestAlloc { .. } => &self.alloc,
            RuntimeError::Trap { .. } => &self.trap,
            RuntimeError::FuelExhausted => &self.fuel,
            _ => &self.other,
        };
        if budget.allow() {
            warn!(error = %truncate(&err.to_string()), "Guest process call failed");
        }
    }

    /// Diagnostics dropped by the rate limits so far.
    pub(crate) fn suppressed(&self) -> u64 {
        [
            &self.not_ready,
            &self.mismatch,
            &self.attach,
            &self.alloc,
            &self.trap,
            &self.fuel,
            &self.other,
        ]
        .iter()
        .map(|budget| budget.suppressed())
        .sum()
    }
}

impl AotEngine {
    /// Run the entry point over `input`, writing the result into `output`.
    ///
    /// The calling thread is attached to the guest runtime on its first call.
    /// An empty block is a successful no-op.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::EngineNotReady`] if no entry point is resolved
    /// - [`RuntimeError::ThreadAttach`] if the thread cannot be attached
    /// - [`RuntimeError::BufferMismatch`] if the buffers differ in length
    /// - [`RuntimeError::GuestAlloc`] if guest buffers cannot be allocated
    /// - [`RuntimeError::Trap`] or [`RuntimeError::FuelExhausted`] if the call fails
    ///
    /// On every error `output` is left unmodified.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), RuntimeError> {
        let result = self.dispatch(input, output);
        match &result {
            Ok(()) => self.diagnostics.success(input.len()),
            Err(err) => self.diagnostics.failure(err),
        }
        result
    }

    /// Per-call diagnostics suppressed by rate limiting.
    pub fn suppressed_diagnostics(&self) -> u64 {
        self.diagnostics.suppressed()
    }

    fn dispatch(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), RuntimeError> {
        if self.entry_point.is_none() {
            return Err(RuntimeError::EngineNotReady);
        }

        thread_env::ensure_attached()?;

        if input.len() != output.len() {
            return Err(RuntimeError::BufferMismatch {
                input: input.len(),
                output: output.len(),
            });
        }
        if input.is_empty() {
            return Ok(());
        }

        let (Some(entry), Some(instance), Some(exec_env)) = (
            self.entry_point.as_ref(),
            self.instance.as_mut(),
            self.exec_env.as_mut(),
        ) else {
            return Err(RuntimeError::EngineNotReady);
        };

        let result = match entry {
            EntryPoint::Buffer(func) => process_buffer(instance, exec_env, func, input, output),
            EntryPoint::Scalar(func) => process_scalar(instance, exec_env, func, input, output),
        };

        match &result {
            Ok(()) => exec_env.metrics.calls += 1,
            Err(RuntimeError::Trap { .. } | RuntimeError::FuelExhausted) => {
                exec_env.metrics.traps += 1;
            }
            Err(RuntimeError::GuestAlloc { .. }) => exec_env.metrics.alloc_failures += 1,
            Err(_) => {}
        }
        result
    }
}

fn process_buffer(
    instance: &mut GuestInstance,
    exec_env: &mut ExecEnv,
    func: &wasmtime::TypedFunc<(u32, u32, u32), ()>,
    input: &[f32],
    output: &mut [f32],
) -> Result<(), RuntimeError> {
    let bytes = input.len() * SAMPLE_WIDTH;
    let count = u32::try_from(input.len()).map_err(|_| RuntimeError::GuestAlloc { bytes })?;
    let fuel = exec_env.fuel_per_call();

    // Guest-side allocators run inside the fuel budget too.
    instance.refuel(fuel)?;

    let Some(input_offset) = instance.alloc(bytes) else {
        return Err(RuntimeError::GuestAlloc { bytes });
    };
    let Some(output_offset) = instance.alloc(bytes) else {
        instance.free(input_offset);
        return Err(RuntimeError::GuestAlloc { bytes });
    };

    let result = instance
        .write_samples(input_offset, input)
        .and_then(|()| instance.call_buffer(func, input_offset, output_offset, count))
        .and_then(|()| instance.read_samples(output_offset, output));

    if let Some(granted) = fuel {
        exec_env.metrics.last_fuel_consumed = instance.fuel_consumed(granted);
        // A call that ran dry still has to release its blocks.
        if let Err(e) = instance.refuel(fuel) {
            warn!(error = %e, "Could not refuel before releasing guest buffers");
        }
    }

    instance.free(output_offset);
    instance.free(input_offset);

    result
}

fn process_scalar(
    instance: &mut GuestInstance,
    exec_env: &mut ExecEnv,
    func: &wasmtime::TypedFunc<f32, f32>,
    input: &[f32],
    output: &mut [f32],
) -> Result<(), RuntimeError> {
    let fuel = exec_env.fuel_per_call();
    exec_env.scratch.clear();

    for &sample in input {
        instance.refuel(fuel)?;
        let processed = instance.call_scalar(func, sample)?;
        exec_env.scratch.push(processed);
    }

    if let Some(granted) = fuel {
        exec_env.metrics.last_fuel_consumed = instance.fuel_consumed(granted);
    }

    output.copy_from_slice(&exec_env.scratch);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_rate_limited_per_kind() {
        let diag = CallDiagnostics::new();

        diag.failure(&RuntimeError::FuelExhausted);
        diag.failure(&RuntimeError::FuelExhausted);
        diag.failure(&RuntimeError::FuelExhausted);
        assert_eq!(diag.suppressed(), 2);

        // A different kind still gets its first report through.
        diag.failure(&RuntimeError::GuestAlloc { bytes: 512 });
        assert_eq!(diag.suppressed(), 2);
        diag.failure(&RuntimeError::GuestAlloc { bytes: 512 });
        assert_eq!(diag.suppressed(), 3);
    }

    #[test]
    fn test_success_reports_limited() {
        let diag = CallDiagnostics::new();
        for _ in 0..10 {
            diag.success(128);
        }
        assert_eq!(diag.successes.suppressed(), 7);
    }

    #[test]
    fn test_process_requires_entry_point() {
        let mut engine = AotEngine::new();
        let mut output = [1.0f32; 4];

        let err = engine.process(&[0.0; 4], &mut output).unwrap_err();
        assert!(matches!(err, RuntimeError::EngineNotReady));
        assert_eq!(output, [1.0; 4]);
    }
}
