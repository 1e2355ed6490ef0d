//! Store creation and per-call fuel accounting.
//!
//! This module provides:
//! - [`GuestState`]: host data attached to the guest's store
//! - [`create_store`]: a store with resource limits installed
//! - Fuel helpers used around every guest call

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};

use crate::WasmEngine;
use dsp_runtime_common::RuntimeError;

/// Host data owned by the guest's store.
///
/// Guests have no host imports, so the only state is the resource limiter.
pub struct GuestState {
    limits: StoreLimits,
}

impl GuestState {
    fn new() -> Self {
        Self {
            limits: StoreLimitsBuilder::new()
                .instances(1)
                .memories(1)
                .tables(1)
                .build(),
        }
    }

    /// Freeze linear memory at `bytes`: any later `memory.grow` fails.
    pub fn freeze_memory(&mut self, bytes: usize) {
        self.limits = StoreLimitsBuilder::new()
            .memory_size(bytes)
            .instances(1)
            .memories(1)
            .tables(1)
            .build();
    }
}

/// Create a new Wasmtime store for a single module instance.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(engine: &WasmEngine) -> Result<Store<GuestState>, RuntimeError> {
    let mut store = Store::new(engine.inner(), GuestState::new());
    store.limiter(|state| &mut state.limits);

    // Instantiation runs start functions; give them one call's worth of fuel.
    if let Some(fuel) = engine.config().fuel_per_call {
        refuel(&mut store, fuel)?;
    }

    Ok(store)
}

/// Reset the store's fuel to `fuel` before a guest call.
///
/// # Errors
///
/// Returns an error if fuel metering is not enabled on the engine.
pub fn refuel(store: &mut Store<GuestState>, fuel: u64) -> Result<(), RuntimeError> {
    store
        .set_fuel(fuel)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))
}

/// Fuel left in the store, or `None` when metering is off.
pub fn remaining_fuel(store: &Store<GuestState>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Fuel spent since the store was refuelled with `granted`.
pub fn fuel_consumed(store: &Store<GuestState>, granted: u64) -> Option<u64> {
    remaining_fuel(store).map(|left| granted.saturating_sub(left))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::alloc::{AlignedAllocator, RegionAllocator};
    use dsp_runtime_common::EngineConfig;

    fn engine(fuel_per_call: Option<u64>) -> WasmEngine {
        let region = Arc::new(RegionAllocator::new(1024 * 1024));
        let config = EngineConfig {
            fuel_per_call,
            ..Default::default()
        };
        WasmEngine::new(&config, Arc::new(AlignedAllocator::new(region))).unwrap()
    }

    #[test]
    fn test_store_creation() {
        let store = create_store(&engine(None));
        assert!(store.is_ok());
    }

    #[test]
    fn test_store_without_metering_has_no_fuel() {
        let store = create_store(&engine(None)).unwrap();
        assert_eq!(remaining_fuel(&store), None);
        assert_eq!(fuel_consumed(&store, 100), None);
    }

    #[test]
    fn test_store_fuel() {
        let mut store = create_store(&engine(Some(1000))).unwrap();
        assert_eq!(remaining_fuel(&store), Some(1000));

        refuel(&mut store, 250).unwrap();
        assert_eq!(remaining_fuel(&store), Some(250));
        assert_eq!(fuel_consumed(&store, 1000), Some(750));
    }

    #[test]
    fn test_refuel_without_metering_fails() {
        let mut store = create_store(&engine(None)).unwrap();
        let err = refuel(&mut store, 10).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }
}
