//! Block-processing benchmark.
//!
//! Runs a processing function on random blocks the way the audio callback
//! would, then reports latency and whether it keeps up with the sample rate.

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::signal::SignalSource;

/// Benchmark parameters.
#[derive(Debug, Clone, Copy)]
pub struct BenchConfig {
    /// Single-sample calls made before timing starts.
    pub warmup_runs: usize,
    /// Timed block calls.
    pub runs: usize,
    /// Samples per block.
    pub block_size: usize,
    /// Sample rate the real-time factor is measured against.
    pub sample_rate: u32,
    /// Seed for the random input blocks.
    pub seed: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            warmup_runs: 10,
            runs: 100,
            block_size: 128,
            sample_rate: 48_000,
            seed: 0x5EED,
        }
    }
}

/// Timing samples in microseconds.
#[derive(Debug, Clone, Default)]
pub struct TimingStats {
    samples: Vec<f64>,
}

impl TimingStats {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a timing sample in microseconds.
    pub fn record(&mut self, us: f64) {
        self.samples.push(us);
    }

    /// Get the number of samples.
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Get the mean in microseconds.
    pub fn mean_us(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Get the minimum in microseconds.
    pub fn min_us(&self) -> f64 {
        self.samples.iter().copied().reduce(f64::min).unwrap_or(0.0)
    }

    /// Get the maximum in microseconds.
    pub fn max_us(&self) -> f64 {
        self.samples.iter().copied().reduce(f64::max).unwrap_or(0.0)
    }
}

/// Outcome of a benchmark run.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    /// Timed iterations.
    pub iterations: usize,
    /// Samples per block.
    pub block_size: usize,
    /// Sum of the warm-up outputs.
    pub warmup_result: f32,
    /// Mean block time in microseconds.
    pub avg_us: f64,
    /// Fastest block in microseconds.
    pub min_us: f64,
    /// Slowest block in microseconds.
    pub max_us: f64,
    /// Sum of every output sample; keeps the work observable.
    pub checksum: f32,
    /// Timed calls that returned an error.
    pub failed_runs: usize,
    /// Samples processed per second at the mean block time.
    pub throughput: f64,
    /// Throughput divided by the sample rate.
    pub realtime_factor: f64,
    /// Sample rate used for the real-time factor.
    pub sample_rate: u32,
}

impl BenchmarkReport {
    /// Whether processing keeps up with the sample rate.
    pub fn can_run_realtime(&self) -> bool {
        self.realtime_factor >= 1.0
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== BENCHMARK RESULTS ===")?;
        writeln!(f, "Iterations: {}", self.iterations)?;
        writeln!(f, "Average:    {:.3} us", self.avg_us)?;
        writeln!(f, "Minimum:    {:.3} us", self.min_us)?;
        writeln!(f, "Maximum:    {:.3} us", self.max_us)?;
        writeln!(f, "Checksum:   {:.3}", self.checksum)?;
        if self.failed_runs > 0 {
            writeln!(f, "Failed:     {}", self.failed_runs)?;
        }
        writeln!(f)?;
        writeln!(f, "=== REAL-TIME ANALYSIS ===")?;
        writeln!(f, "Sample rate: {} Hz", self.sample_rate)?;
        writeln!(f, "Throughput: {:.3} samples/sec", self.throughput)?;
        writeln!(f, "Real-time factor: {:.3}x", self.realtime_factor)?;
        if self.can_run_realtime() {
            write!(f, "Result: CAN run in real time")
        } else {
            write!(f, "Result: too slow for real time")
        }
    }
}

/// Benchmark `process` over random blocks.
///
/// `process` gets an input block and an output block of equal length. Failed
/// calls are counted and still timed; their output contributes nothing.
pub fn run_benchmark<F, E>(config: &BenchConfig, mut process: F) -> BenchmarkReport
where
    F: FnMut(&[f32], &mut [f32]) -> Result<(), E>,
{
    let mut source = SignalSource::noise(config.seed);

    debug!(runs = config.warmup_runs, "Benchmark warm-up");
    let mut warmup_result = 0.0f32;
    for _ in 0..config.warmup_runs {
        let input = [source.next_sample()];
        let mut output = [0.0f32];
        if process(&input, &mut output).is_ok() {
            warmup_result += output[0];
        }
    }

    info!(
        runs = config.runs,
        block_size = config.block_size,
        "Benchmark running"
    );
    let mut timings = TimingStats::new();
    let mut checksum = 0.0f32;
    let mut failed_runs = 0;
    let mut input = vec![0.0f32; config.block_size];
    let mut output = vec![0.0f32; config.block_size];

    for _ in 0..config.runs {
        source.fill(&mut input);
        output.fill(0.0);

        let start = Instant::now();
        let result = process(&input, &mut output);
        timings.record(start.elapsed().as_secs_f64() * 1e6);

        match result {
            Ok(()) => checksum += output.iter().sum::<f32>(),
            Err(_) => failed_runs += 1,
        }
    }

    let avg_us = timings.mean_us();
    let throughput = if avg_us > 0.0 {
        config.block_size as f64 / avg_us * 1e6
    } else {
        0.0
    };

    BenchmarkReport {
        iterations: timings.count(),
        block_size: config.block_size,
        warmup_result,
        avg_us,
        min_us: timings.min_us(),
        max_us: timings.max_us(),
        checksum,
        failed_runs,
        throughput,
        realtime_factor: throughput / f64::from(config.sample_rate),
        sample_rate: config.sample_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_stats() {
        let mut stats = TimingStats::new();
        assert_eq!(stats.mean_us(), 0.0);
        assert_eq!(stats.min_us(), 0.0);

        stats.record(2.0);
        stats.record(4.0);
        stats.record(9.0);
        assert_eq!(stats.count(), 3);
        assert_eq!(stats.mean_us(), 5.0);
        assert_eq!(stats.min_us(), 2.0);
        assert_eq!(stats.max_us(), 9.0);
    }

    #[test]
    fn test_identity_benchmark() {
        let config = BenchConfig {
            runs: 20,
            ..Default::default()
        };
        let mut calls = 0;
        let report = run_benchmark(&config, |input: &[f32], output: &mut [f32]| {
            calls += 1;
            output.copy_from_slice(input);
            Ok::<(), ()>(())
        });

        assert_eq!(calls, 30);
        assert_eq!(report.iterations, 20);
        assert_eq!(report.failed_runs, 0);
        assert!(report.min_us <= report.avg_us && report.avg_us <= report.max_us);
        assert!(report.checksum.is_finite());
    }

    #[test]
    fn test_failures_counted() {
        let config = BenchConfig {
            warmup_runs: 0,
            runs: 5,
            ..Default::default()
        };
        let report = run_benchmark(&config, |_: &[f32], _: &mut [f32]| Err::<(), _>("boom"));

        assert_eq!(report.failed_runs, 5);
        assert_eq!(report.checksum, 0.0);
    }

    #[test]
    fn test_realtime_verdict() {
        let mut report = run_benchmark(
            &BenchConfig {
                warmup_runs: 0,
                runs: 1,
                ..Default::default()
            },
            |_: &[f32], _: &mut [f32]| Ok::<(), ()>(()),
        );
        report.realtime_factor = 1.5;
        assert!(report.can_run_realtime());
        assert!(report.to_string().contains("CAN run"));

        report.realtime_factor = 0.5;
        assert!(!report.can_run_realtime());
    }
}
