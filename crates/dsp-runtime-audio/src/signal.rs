//! Test signal sources.

use std::f32::consts::TAU;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Kind of signal fed into the input channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SignalKind {
    /// All zeros.
    #[default]
    Silence,
    /// A sine wave of the given frequency in Hz and peak amplitude.
    Sine {
        /// Frequency in Hz.
        frequency: f32,
        /// Peak amplitude.
        amplitude: f32,
    },
    /// Uniform white noise in `[-1, 1)`.
    Noise {
        /// Seed for reproducible runs.
        seed: u64,
    },
}

/// A stateful generator producing one block at a time.
#[derive(Debug, Clone)]
pub struct SignalSource {
    kind: SignalKind,
    sample_rate: f32,
    phase: f32,
    rng: StdRng,
}

impl SignalSource {
    /// Create a source for `kind` at `sample_rate` Hz.
    pub fn new(kind: SignalKind, sample_rate: u32) -> Self {
        let seed = match kind {
            SignalKind::Noise { seed } => seed,
            _ => 0,
        };
        Self {
            kind,
            sample_rate: sample_rate as f32,
            phase: 0.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform noise in `[-1, 1)` with the given seed.
    pub fn noise(seed: u64) -> Self {
        Self::new(SignalKind::Noise { seed }, 48_000)
    }

    /// The signal this source generates.
    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Overwrite `block` with the next samples.
    pub fn fill(&mut self, block: &mut [f32]) {
        match self.kind {
            SignalKind::Silence => block.fill(0.0),
            SignalKind::Sine {
                frequency,
                amplitude,
            } => {
                let step = TAU * frequency / self.sample_rate;
                for sample in block {
                    *sample = amplitude * self.phase.sin();
                    self.phase = (self.phase + step) % TAU;
                }
            }
            SignalKind::Noise { .. } => {
                for sample in block {
                    *sample = self.rng.gen_range(-1.0..1.0);
                }
            }
        }
    }

    /// A single sample.
    pub fn next_sample(&mut self) -> f32 {
        let mut sample = [0.0];
        self.fill(&mut sample);
        sample[0]
    }
}
