//! Simulated audio driver.
//!
//! Stands in for the board's audio hardware: a dedicated real-time thread
//! produces one block per period, hands it to the callback, and records how
//! long the callback took. Callbacks never run on the thread that started
//! the driver.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use dsp_runtime_common::AudioConfig;

use crate::signal::SignalSource;

/// Name of the audio thread.
pub const AUDIO_THREAD_NAME: &str = "audio";

/// Driver errors.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The audio configuration cannot be driven.
    #[error("Invalid audio configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// The audio thread could not be started.
    #[error("Failed to spawn audio thread: {0}")]
    Spawn(#[from] io::Error),

    /// The callback panicked.
    #[error("Audio thread panicked")]
    Panicked,
}

/// One block of audio, non-interleaved.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    inputs: Vec<Vec<f32>>,
    outputs: Vec<Vec<f32>>,
}

impl AudioBlock {
    /// A silent block of `channels` x `size` samples.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::InvalidConfig`] for zero channels; channel 0
    /// always exists once a block is built.
    pub fn new(channels: usize, size: usize) -> Result<Self, DriverError> {
        if channels == 0 {
            return Err(DriverError::InvalidConfig {
                reason: "at least one channel is required".into(),
            });
        }
        Ok(Self {
            inputs: vec![vec![0.0; size]; channels],
            outputs: vec![vec![0.0; size]; channels],
        })
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.inputs.first().map_or(0, Vec::len)
    }

    /// Whether the block holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.inputs.len()
    }

    /// Input samples of `channel`.
    ///
    /// # Panics
    ///
    /// Panics if `channel >= self.channels()`.
    pub fn input(&self, channel: usize) -> &[f32] {
        &self.inputs[channel]
    }

    /// Output samples of `channel`.
    ///
    /// # Panics
    ///
    /// Panics if `channel >= self.channels()`.
    pub fn output(&self, channel: usize) -> &[f32] {
        &self.outputs[channel]
    }

    /// Channel 0 input and output, for mono processing.
    pub fn mono(&mut self) -> (&[f32], &mut [f32]) {
        (&self.inputs[0], &mut self.outputs[0])
    }

    /// Copy output channel 0 into every other output channel.
    pub fn duplicate_first_output(&mut self) {
        if let Some((first, rest)) = self.outputs.split_first_mut() {
            for channel in rest {
                channel.copy_from_slice(first);
            }
        }
    }
}

/// What the driver observed.
#[derive(Debug, Clone, Default)]
pub struct DriverReport {
    /// Blocks delivered to the callback.
    pub blocks: u64,
    /// Blocks whose callback ran longer than the block period.
    pub overruns: u64,
    /// Slowest callback in microseconds.
    pub max_callback_us: f64,
    /// Mean callback time in microseconds.
    pub mean_callback_us: f64,
}

/// How the driver schedules blocks.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Block size, sample rate and channel count.
    pub audio: AudioConfig,
    /// Sleep until each block's deadline instead of running flat out.
    pub paced: bool,
    /// Stop after this many blocks; `None` runs until stopped.
    pub max_blocks: Option<u64>,
}

impl DriverConfig {
    fn validate(&self) -> Result<(), DriverError> {
        if self.audio.block_size == 0 {
            return Err(DriverError::InvalidConfig {
                reason: "block_size must be non-zero".into(),
            });
        }
        if self.audio.sample_rate == 0 {
            return Err(DriverError::InvalidConfig {
                reason: "sample_rate must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// A running audio thread.
#[derive(Debug)]
pub struct AudioStream<C> {
    handle: JoinHandle<(DriverReport, C)>,
    stop: Arc<AtomicBool>,
}

impl<C> AudioStream<C> {
    /// Ask the audio thread to stop after the current block.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Whether the audio thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the audio thread and take back the callback.
    pub fn join(self) -> Result<(DriverReport, C), DriverError> {
        self.handle.join().map_err(|_| DriverError::Panicked)
    }
}

/// Start the audio thread.
///
/// Each period the driver fills input channel 0 from `source` (other input
/// channels stay silent), clears the outputs and calls `callback`.
pub fn start<C>(
    config: DriverConfig,
    mut source: SignalSource,
    mut callback: C,
) -> Result<AudioStream<C>, DriverError>
where
    C: FnMut(&mut AudioBlock) + Send + 'static,
{
    config.validate()?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let period = Duration::from_secs_f64(config.audio.block_period_us() / 1e6);

    info!(
        block_size = config.audio.block_size,
        sample_rate = config.audio.sample_rate,
        channels = config.audio.channels,
        period_us = period.as_micros(),
        paced = config.paced,
        "Starting audio"
    );

    let mut block = AudioBlock::new(config.audio.channels, config.audio.block_size)?;
    let handle = thread::Builder::new()
        .name(AUDIO_THREAD_NAME.into())
        .spawn(move || {
            let mut report = DriverReport::default();
            let mut total_us = 0.0;
            let mut deadline = Instant::now() + period;

            while !stop_flag.load(Ordering::Relaxed)
                && config.max_blocks.is_none_or(|max| report.blocks < max)
            {
                source.fill(&mut block.inputs[0]);
                for channel in &mut block.outputs {
                    channel.fill(0.0);
                }

                let start = Instant::now();
                callback(&mut block);
                let elapsed = start.elapsed();

                let elapsed_us = elapsed.as_secs_f64() * 1e6;
                total_us += elapsed_us;
                report.max_callback_us = report.max_callback_us.max(elapsed_us);
                report.blocks += 1;
                if elapsed > period {
                    report.overruns += 1;
                    if report.overruns == 1 {
                        warn!(
                            elapsed_us,
                            period_us = period.as_micros(),
                            "Audio callback overran its block period"
                        );
                    }
                }

                if config.paced {
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    }
                    deadline += period;
                }
            }

            if report.blocks > 0 {
                report.mean_callback_us = total_us / report.blocks as f64;
            }
            debug!(
                blocks = report.blocks,
                overruns = report.overruns,
                "Audio thread exiting"
            );
            (report, callback)
        })?;

    Ok(AudioStream { handle, stop })
}
