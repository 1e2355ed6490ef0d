//! Integration tests for dsp-runtime-core.
//!
//! These tests drive the complete pipeline:
//! - WAT to binary to precompiled artifact
//! - Engine bring-up through every lifecycle stage
//! - Buffer and scalar marshalling through `process`
//! - Failure isolation, teardown and leak accounting

use std::sync::Arc;
use std::thread;

use dsp_runtime_common::{
    EngineConfig, EntrySignature, GuestConfig, MemorySource, RuntimeConfig, RuntimeError,
};
use dsp_runtime_core::{
    AlignedAllocator, AotEngine, EngineState, HeapKind, RegionAllocator, WasmEngine, thread_env,
};

const IDENTITY_BUFFER: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "process") (param $in i32) (param $out i32) (param $n i32)
        (memory.copy
          (local.get $out)
          (local.get $in)
          (i32.shl (local.get $n) (i32.const 2)))))
"#;

const HALF_GAIN_BUFFER: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "process") (param $in i32) (param $out i32) (param $n i32)
        (local $i i32)
        (block $done
          (loop $next
            (br_if $done (i32.ge_u (local.get $i) (local.get $n)))
            (f32.store
              (i32.add (local.get $out) (i32.shl (local.get $i) (i32.const 2)))
              (f32.mul
                (f32.load (i32.add (local.get $in) (i32.shl (local.get $i) (i32.const 2))))
                (f32.const 0.5)))
            (local.set $i (i32.add (local.get $i) (i32.const 1)))
            (br $next)))))
"#;

const TRAPPING_BUFFER: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "process") (param i32 i32 i32) unreachable))
"#;

const SPINNING_BUFFER: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "process") (param i32 i32 i32)
        (loop $forever (br $forever))))
"#;

const IDENTITY_SCALAR: &str = r#"
    (module
      (func (export "process") (param f32) (result f32) local.get 0))
"#;

/// Recurses once per unit of its input and returns the depth reached.
const RECURSIVE_SCALAR: &str = r#"
    (module
      (func $descend (param $depth f32) (result f32)
        (if (result f32) (f32.le (local.get $depth) (f32.const 0))
          (then (f32.const 0))
          (else
            (f32.add
              (f32.const 1)
              (call $descend (f32.sub (local.get $depth) (f32.const 1)))))))
      (func (export "process") (param f32) (result f32)
        (call $descend (local.get 0))))
"#;

const NO_ENTRY_POINT: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "run") (param i32 i32 i32)))
"#;

/// Bump allocator exported as malloc/free; resets when nothing is live.
const EXPORTED_HEAP: &str = r#"
    (module
      (memory (export "memory") 1)
      (global $next (mut i32) (i32.const 1024))
      (global $live (mut i32) (i32.const 0))
      (func (export "malloc") (param $n i32) (result i32)
        (local $p i32)
        (local.set $p (global.get $next))
        (if (i32.gt_u (i32.add (local.get $p) (local.get $n)) (i32.const 65536))
          (then (return (i32.const 0))))
        (global.set $next
          (i32.and
            (i32.add (i32.add (local.get $p) (local.get $n)) (i32.const 7))
            (i32.const -8)))
        (global.set $live (i32.add (global.get $live) (i32.const 1)))
        (local.get $p))
      (func (export "free") (param i32)
        (global.set $live (i32.sub (global.get $live) (i32.const 1)))
        (if (i32.eqz (global.get $live))
          (then (global.set $next (i32.const 1024)))))
      (func (export "process") (param $in i32) (param $out i32) (param $n i32)
        (memory.copy
          (local.get $out)
          (local.get $in)
          (i32.shl (local.get $n) (i32.const 2)))))
"#;

// ============================================================================
// Helpers
// ============================================================================

fn region() -> Arc<RegionAllocator> {
    Arc::new(RegionAllocator::new(8 * 1024 * 1024))
}

fn adapter(region: &Arc<RegionAllocator>) -> Arc<AlignedAllocator> {
    Arc::new(AlignedAllocator::new(region.clone()))
}

/// Precompile `wat` for engines built from `config`.
fn artifact(config: &EngineConfig, wat: &str) -> Vec<u8> {
    let wasm = wat::parse_str(wat).unwrap();
    WasmEngine::new(config, adapter(&region()))
        .unwrap()
        .precompile(&wasm)
        .unwrap()
}

fn buffer_config(heap_budget: usize) -> RuntimeConfig {
    RuntimeConfig {
        guest: GuestConfig {
            heap_budget,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn scalar_config() -> RuntimeConfig {
    RuntimeConfig {
        guest: GuestConfig {
            heap_budget: 0,
            entry_signature: EntrySignature::Scalar,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn bring_up(config: &RuntimeConfig, wat: &str) -> (Arc<RegionAllocator>, AotEngine) {
    let region = region();
    let image = artifact(&AotEngine::engine_config(config), wat);
    let engine = AotEngine::bring_up(config, adapter(&region), &image).unwrap();
    (region, engine)
}

// ============================================================================
// Test: Scenarios
// ============================================================================

#[test]
fn test_single_sample_scenario_buffer() {
    let (_region, mut engine) = bring_up(&buffer_config(16 * 1024), IDENTITY_BUFFER);

    for x in [0.0f32, 0.1, 0.2, 0.3, 0.4] {
        let mut y = [f32::NAN];
        engine.process(&[x], &mut y).unwrap();
        assert_eq!(y[0], x);
    }
}

#[test]
fn test_single_sample_scenario_scalar() {
    let (_region, mut engine) = bring_up(&scalar_config(), IDENTITY_SCALAR);

    for x in [0.0f32, 0.1, 0.2, 0.3, 0.4] {
        let mut y = [f32::NAN];
        engine.process(&[x], &mut y).unwrap();
        assert_eq!(y[0], x);
    }
    assert_eq!(engine.metrics().unwrap().calls, 5);
}

#[test]
fn test_zero_block_no_leaks() {
    let (_region, mut engine) = bring_up(&buffer_config(16 * 1024), IDENTITY_BUFFER);
    let before = engine.heap_stats().unwrap();

    let input = [0.0f32; 128];
    let mut output = [1.0f32; 128];
    engine.process(&input, &mut output).unwrap();

    assert!(output.iter().all(|&s| s == 0.0));
    let after = engine.heap_stats().unwrap();
    assert_eq!(after.live_allocations, 0);
    assert_eq!(after.outstanding_bytes, before.outstanding_bytes);
}

#[test]
fn test_transformation_round_trip() {
    let (_region, mut engine) = bring_up(&buffer_config(16 * 1024), HALF_GAIN_BUFFER);

    let input: Vec<f32> = (0..256).map(|i| i as f32 / 16.0 - 8.0).collect();
    let mut output = vec![0.0f32; input.len()];
    engine.process(&input, &mut output).unwrap();

    for (x, y) in input.iter().zip(&output) {
        assert_eq!(*y, x * 0.5);
    }
    assert_eq!(engine.heap_stats().unwrap().live_allocations, 0);
}

// ============================================================================
// Test: Per-call Failures
// ============================================================================

#[test]
fn test_allocation_failure_isolated() {
    // 1 KiB of heap: two 128-sample buffers fit, two 200-sample ones do not.
    let (_region, mut engine) = bring_up(&buffer_config(1024), IDENTITY_BUFFER);

    let mut output = [0.0f32; 128];
    engine.process(&[0.25; 128], &mut output).unwrap();
    assert!(output.iter().all(|&s| s == 0.25));

    let mut big_output = [7.0f32; 200];
    let err = engine.process(&[0.5; 200], &mut big_output).unwrap_err();
    assert!(matches!(err, RuntimeError::GuestAlloc { bytes: 800 }));
    assert!(err.is_transient());
    assert!(big_output.iter().all(|&s| s == 7.0));
    assert!(output.iter().all(|&s| s == 0.25));

    engine.process(&[0.75; 128], &mut output).unwrap();
    assert!(output.iter().all(|&s| s == 0.75));

    let stats = engine.heap_stats().unwrap();
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(engine.metrics().unwrap().alloc_failures, 1);
}

#[test]
fn test_trap_leaves_output_untouched() {
    let (_region, mut engine) = bring_up(&buffer_config(16 * 1024), TRAPPING_BUFFER);

    let mut output = [3.0f32; 16];
    let err = engine.process(&[1.0; 16], &mut output).unwrap_err();

    assert!(matches!(err, RuntimeError::Trap { .. }));
    assert!(output.iter().all(|&s| s == 3.0));
    assert_eq!(engine.heap_stats().unwrap().live_allocations, 0);
    assert_eq!(engine.state(), EngineState::Ready);

    // Repeated identical failures stay per-call and are rate limited.
    for _ in 0..5 {
        assert!(engine.process(&[1.0; 16], &mut output).is_err());
    }
    assert_eq!(engine.metrics().unwrap().traps, 6);
    assert_eq!(engine.suppressed_diagnostics(), 5);
}

#[test]
fn test_stack_budget_bounds_guest_calls() {
    let (_region, mut engine) = bring_up(&scalar_config(), RECURSIVE_SCALAR);

    let mut output = [0.0f32];
    engine.process(&[20.0], &mut output).unwrap();
    assert_eq!(output[0], 20.0);

    // Thousands of frames cannot fit in an 8 KiB budget.
    let mut output = [-1.0f32];
    let err = engine.process(&[5000.0], &mut output).unwrap_err();
    assert!(matches!(err, RuntimeError::Trap { .. }));
    assert_eq!(output[0], -1.0);
    assert_eq!(engine.state(), EngineState::Ready);

    // The engine keeps serving calls that fit.
    engine.process(&[3.0], &mut output).unwrap();
    assert_eq!(output[0], 3.0);
}

#[test]
fn test_larger_stack_budget_allows_deeper_calls() {
    let mut config = scalar_config();
    config.guest.stack_budget = 384 * 1024;
    let (_region, mut engine) = bring_up(&config, RECURSIVE_SCALAR);

    let mut output = [0.0f32];
    engine.process(&[5000.0], &mut output).unwrap();
    assert_eq!(output[0], 5000.0);
}

#[test]
fn test_fuel_exhaustion_is_per_call() {
    let mut config = buffer_config(16 * 1024);
    config.engine.fuel_per_call = Some(10_000);
    let (_region, mut engine) = bring_up(&config, SPINNING_BUFFER);

    let mut output = [2.0f32; 8];
    let err = engine.process(&[1.0; 8], &mut output).unwrap_err();
    assert!(matches!(err, RuntimeError::FuelExhausted));
    assert!(output.iter().all(|&s| s == 2.0));
    assert_eq!(engine.heap_stats().unwrap().live_allocations, 0);

    // The next call gets a fresh budget rather than an empty tank.
    let err = engine.process(&[1.0; 8], &mut output).unwrap_err();
    assert!(matches!(err, RuntimeError::FuelExhausted));
}

#[test]
fn test_fuel_metering_reports_consumption() {
    let mut config = buffer_config(16 * 1024);
    config.engine.fuel_per_call = Some(1_000_000);
    let (_region, mut engine) = bring_up(&config, HALF_GAIN_BUFFER);

    let mut output = [0.0f32; 64];
    engine.process(&[1.0; 64], &mut output).unwrap();

    let consumed = engine.metrics().unwrap().last_fuel_consumed.unwrap();
    assert!(consumed > 0 && consumed < 1_000_000);
}

#[test]
fn test_buffer_mismatch_and_empty_input() {
    let (_region, mut engine) = bring_up(&buffer_config(16 * 1024), IDENTITY_BUFFER);

    let mut output = [0.0f32; 4];
    assert!(matches!(
        engine.process(&[1.0; 8], &mut output),
        Err(RuntimeError::BufferMismatch { input: 8, output: 4 })
    ));

    assert!(engine.process(&[], &mut []).is_ok());
}

#[test]
fn test_no_heap_fails_every_buffer_call() {
    let (_region, mut engine) = bring_up(&buffer_config(0), IDENTITY_BUFFER);
    assert_eq!(engine.heap_stats().unwrap().kind, HeapKind::None);

    let mut output = [0.0f32; 4];
    assert!(matches!(
        engine.process(&[1.0; 4], &mut output),
        Err(RuntimeError::GuestAlloc { .. })
    ));
}

#[test]
fn test_exported_heap() {
    let (_region, mut engine) = bring_up(&buffer_config(0), EXPORTED_HEAP);
    assert_eq!(engine.heap_stats().unwrap().kind, HeapKind::Exports);

    let input: Vec<f32> = (0..128).map(|i| i as f32).collect();
    let mut output = vec![0.0f32; 128];
    for _ in 0..100 {
        engine.process(&input, &mut output).unwrap();
    }

    assert_eq!(output, input);
    assert_eq!(engine.heap_stats().unwrap().live_allocations, 0);
}

// ============================================================================
// Test: Lifecycle
// ============================================================================

#[test]
fn test_missing_entry_point_is_fatal() {
    let region = region();
    let config = buffer_config(16 * 1024);
    let image = artifact(&AotEngine::engine_config(&config), NO_ENTRY_POINT);

    let err = AotEngine::bring_up(&config, adapter(&region), &image).unwrap_err();
    assert!(matches!(err, RuntimeError::EntryPointNotFound { ref name } if name == "process"));
    assert!(err.is_fatal());
}

#[test]
fn test_wrong_signature_is_entry_point_error() {
    let region = region();
    let config = buffer_config(16 * 1024);
    let image = artifact(&AotEngine::engine_config(&config), IDENTITY_SCALAR);

    let mut engine = AotEngine::new();
    engine.create(&AotEngine::engine_config(&config), adapter(&region)).unwrap();
    engine.load_module(&image).unwrap();
    engine.instantiate(8192, 0).unwrap();
    engine.create_exec_env(8192).unwrap();

    let err = engine
        .resolve_entry_point("process", EntrySignature::Buffer)
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(engine.state(), EngineState::Failed);

    let mut output = [0.0f32; 1];
    assert!(matches!(
        engine.process(&[0.0], &mut output),
        Err(RuntimeError::EngineNotReady)
    ));
}

#[test]
fn test_load_failures_move_to_failed() {
    let region = region();
    let config = EngineConfig::default();
    let raw_wasm = wat::parse_str(IDENTITY_BUFFER).unwrap();

    let images: [&[u8]; 2] = [&raw_wasm, b"\x7fELF but definitely not an artifact"];

    for image in images {
        let mut engine = AotEngine::new();
        engine.create(&config, adapter(&region)).unwrap();

        let err = engine.load_module(image).unwrap_err();
        assert!(matches!(err, RuntimeError::ModuleLoad { .. }));
        assert_eq!(engine.state(), EngineState::Failed);

        engine.destroy();
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }
}

#[test]
fn test_destroy_from_every_state() {
    let region = region();
    let config = buffer_config(16 * 1024);
    let image = artifact(&AotEngine::engine_config(&config), IDENTITY_BUFFER);

    for stages in 0..=5 {
        let mut engine = AotEngine::new();
        if stages >= 1 {
            engine.create(&AotEngine::engine_config(&config), adapter(&region)).unwrap();
        }
        if stages >= 2 {
            engine.load_module(&image).unwrap();
        }
        if stages >= 3 {
            engine.instantiate(8192, 16 * 1024).unwrap();
        }
        if stages >= 4 {
            engine.create_exec_env(8192).unwrap();
        }
        if stages >= 5 {
            engine
                .resolve_entry_point("process", EntrySignature::Buffer)
                .unwrap();
        }

        engine.destroy();
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(engine.heap_stats().is_none());
        assert_eq!(region.live_allocations(), 0, "leak after {stages} stages");
    }
}

#[test]
fn test_linear_memory_comes_from_region() {
    let region = region();
    let config = buffer_config(16 * 1024);
    let image = artifact(&AotEngine::engine_config(&config), IDENTITY_BUFFER);
    let baseline = region.live_allocations();

    let mut engine = AotEngine::bring_up(&config, adapter(&region), &image).unwrap();
    assert_eq!(region.live_allocations(), baseline + 1);
    assert!(region.used() >= 2 * 64 * 1024);

    engine.destroy();
    assert_eq!(region.live_allocations(), baseline);
}

#[test]
fn test_region_exhaustion_fails_instantiate() {
    let region = Arc::new(RegionAllocator::new(32 * 1024));
    let config = buffer_config(16 * 1024);
    let image = artifact(&AotEngine::engine_config(&config), IDENTITY_BUFFER);

    let mut engine = AotEngine::new();
    engine.create(&AotEngine::engine_config(&config), adapter(&region)).unwrap();
    engine.load_module(&image).unwrap();

    let err = engine.instantiate(8192, 16 * 1024).unwrap_err();
    assert!(matches!(err, RuntimeError::Instantiation { .. }));
    assert_eq!(engine.state(), EngineState::Failed);
    assert_eq!(region.live_allocations(), 0);
}

#[test]
fn test_pool_profile() {
    let mut config = buffer_config(16 * 1024);
    config.engine.memory_source = MemorySource::Pool;
    let (region, mut engine) = bring_up(&config, IDENTITY_BUFFER);

    let mut output = [0.0f32; 128];
    engine.process(&[0.5; 128], &mut output).unwrap();
    assert!(output.iter().all(|&s| s == 0.5));

    // Pooled memories never touch the external region.
    assert_eq!(region.live_allocations(), 0);
}

// ============================================================================
// Test: Threads
// ============================================================================

#[test]
fn test_process_from_dedicated_thread() {
    let (_region, engine) = bring_up(&buffer_config(16 * 1024), HALF_GAIN_BUFFER);

    let handle = thread::Builder::new()
        .name("audio".into())
        .spawn(move || {
            let mut engine = engine;
            assert!(!thread_env::is_attached());

            let mut output = [0.0f32; 32];
            engine.process(&[1.0; 32], &mut output).unwrap();
            assert!(thread_env::is_attached());

            engine.process(&[2.0; 32], &mut output).unwrap();
            output
        })
        .unwrap();

    let output = handle.join().unwrap();
    assert!(output.iter().all(|&s| s == 1.0));
}
