//! dsp-runtime CLI entry point.
//!
//! Builds precompiled guest images and runs them the way the device does:
//! a short scenario, a block benchmark, and the audio callback loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use dsp_runtime_audio::{
    AudioBlock, BenchConfig, DriverConfig, SignalKind, SignalSource, driver, run_benchmark,
};
use dsp_runtime_common::ConfigFile;
use dsp_runtime_core::{AlignedAllocator, AotEngine, RegionAllocator, WasmEngine};

#[derive(Debug, Parser)]
#[command(name = "dsp-runtime", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "DSP_RUNTIME_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Precompile a `.wasm` or `.wat` module into a loadable image.
    Compile {
        input: PathBuf,
        /// Output path; defaults to the input with a `.cwasm` extension.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Bring an image up and report its exports and heap.
    Check { image: Option<PathBuf> },
    /// Run the scenario and the block benchmark.
    Bench {
        image: Option<PathBuf>,
        /// Timed runs.
        #[arg(long)]
        runs: Option<usize>,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Process a test signal on the audio thread.
    Run {
        image: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = Signal::Sine)]
        signal: Signal,
        /// How long to run, in seconds.
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        /// Run blocks back to back instead of at the sample rate.
        #[arg(long)]
        unpaced: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Signal {
    Silence,
    Sine,
    Noise,
}

impl Signal {
    fn kind(self) -> SignalKind {
        match self {
            Self::Silence => SignalKind::Silence,
            Self::Sine => SignalKind::Sine {
                frequency: 440.0,
                amplitude: 0.5,
            },
            Self::Noise => SignalKind::Noise { seed: 0x5EED },
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    match cli.command {
        Command::Compile { input, output } => compile(&config, &input, output),
        Command::Check { image } => check(&config, image.as_deref()),
        Command::Bench { image, runs, json } => bench(&config, image.as_deref(), runs, json),
        Command::Run {
            image,
            signal,
            seconds,
            unpaced,
        } => run(&config, image.as_deref(), signal, seconds, !unpaced),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,dsp_runtime=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn allocator(config: &ConfigFile) -> anyhow::Result<Arc<AlignedAllocator>> {
    let capacity = config.runtime.region.capacity_bytes();
    let region = Arc::new(RegionAllocator::new(capacity));
    let allocator = Arc::new(AlignedAllocator::new(region));

    allocator
        .self_test()
        .context("Allocator self-test failed")?;
    info!(capacity, "Allocator self-test passed");
    Ok(allocator)
}

fn read_image(config: &ConfigFile, image: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    let path = match (image, config.module.as_deref()) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(path)) => PathBuf::from(path),
        (None, None) => bail!("No module image given and none set in the config file"),
    };
    std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))
}

fn bring_up(config: &ConfigFile, image: Option<&Path>) -> anyhow::Result<AotEngine> {
    let bytes = read_image(config, image)?;
    let engine = AotEngine::bring_up(&config.runtime, allocator(config)?, &bytes)
        .context("Engine bring-up failed")?;
    info!(state = %engine.state(), "Engine ready");
    Ok(engine)
}

fn compile(config: &ConfigFile, input: &Path, output: Option<PathBuf>) -> anyhow::Result<()> {
    let source =
        std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let engine = WasmEngine::new(&AotEngine::engine_config(&config.runtime), allocator(config)?)?;
    let image = engine.precompile(&source)?;

    let output = output.unwrap_or_else(|| input.with_extension("cwasm"));
    std::fs::write(&output, &image)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(
        input = %input.display(),
        output = %output.display(),
        size = image.len(),
        "Module precompiled"
    );
    Ok(())
}

fn check(config: &ConfigFile, image: Option<&Path>) -> anyhow::Result<()> {
    let engine = bring_up(config, image)?;

    if let Some(module) = engine.module() {
        println!("Module:  {}", module.content_hash());
        println!("Exports: {}", module.exports().join(", "));
    }
    if let Some(signature) = engine.entry_signature() {
        println!(
            "Entry:   {} ({signature:?})",
            config.runtime.guest.entry_point
        );
    }
    if let Some(heap) = engine.heap_stats() {
        println!("Heap:    {}", heap.kind);
    }
    Ok(())
}

fn scenario(engine: &mut AotEngine) {
    for step in 0..5u8 {
        let input = [f32::from(step) * 0.1];
        let mut output = [0.0f32];
        match engine.process(&input, &mut output) {
            Ok(()) => println!("process({:.1}) = {:.6}", input[0], output[0]),
            Err(e) => println!("process({:.1}) failed: {e}", input[0]),
        }
    }
}

fn bench(
    config: &ConfigFile,
    image: Option<&Path>,
    runs: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let mut engine = bring_up(config, image)?;

    if !json {
        scenario(&mut engine);
        println!();
    }

    let defaults = BenchConfig::default();
    let bench_config = BenchConfig {
        runs: runs.unwrap_or(defaults.runs),
        block_size: config.audio.block_size,
        sample_rate: config.audio.sample_rate,
        ..defaults
    };
    let report = run_benchmark(&bench_config, |input, output| engine.process(input, output));

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }

    if let Some(metrics) = engine.metrics() {
        info!(
            calls = metrics.calls,
            traps = metrics.traps,
            alloc_failures = metrics.alloc_failures,
            "Benchmark finished"
        );
    }
    Ok(())
}

fn run(
    config: &ConfigFile,
    image: Option<&Path>,
    signal: Signal,
    seconds: u64,
    paced: bool,
) -> anyhow::Result<()> {
    let mut engine = bring_up(config, image)?;

    let failures = Arc::new(AtomicU64::new(0));
    let failures_seen = Arc::clone(&failures);
    let driver_config = DriverConfig {
        audio: config.audio.clone(),
        paced,
        max_blocks: None,
    };

    let stream = driver::start(
        driver_config,
        SignalSource::new(signal.kind(), config.audio.sample_rate),
        move |block: &mut AudioBlock| {
            let (input, output) = block.mono();
            if engine.process(input, output).is_err() {
                failures_seen.fetch_add(1, Ordering::Relaxed);
            }
            block.duplicate_first_output();
        },
    )
    .context("Failed to start audio")?;

    info!(seconds, "Audio running");
    std::thread::sleep(Duration::from_secs(seconds));
    stream.stop();
    let (report, _) = stream.join().context("Audio thread failed")?;

    let failures = failures.load(Ordering::Relaxed);
    if failures > 0 {
        warn!(failures, "Some blocks were left silent");
    }
    println!(
        "Blocks: {}  Overruns: {}  Mean: {:.3} us  Max: {:.3} us  Failed: {failures}",
        report.blocks, report.overruns, report.mean_callback_us, report.max_callback_us
    );
    Ok(())
}
