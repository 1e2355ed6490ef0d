//! Guest linear memory sourced from the aligned allocator adapter.
//!
//! With [`MemorySource::Adapter`](dsp_runtime_common::MemorySource) the engine
//! is configured with [`AdapterMemoryCreator`], so every linear memory lives in
//! a zeroed block from the external region instead of a private reservation.
//! Memories are fixed-capacity: the module's declared minimum plus the growth
//! reserve set for the guest heap. They never move and never grow past that.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;
use wasmtime::{LinearMemory, MemoryCreator, MemoryType};

use crate::alloc::AlignedAllocator;

/// Creates guest linear memories in the external region.
pub struct AdapterMemoryCreator {
    allocator: Arc<AlignedAllocator>,
    growth_reserve: AtomicUsize,
}

impl AdapterMemoryCreator {
    /// Create a memory creator drawing from `allocator`.
    pub fn new(allocator: Arc<AlignedAllocator>) -> Self {
        Self {
            allocator,
            growth_reserve: AtomicUsize::new(0),
        }
    }

    /// Extra bytes granted to memories created from now on.
    pub fn set_growth_reserve(&self, bytes: usize) {
        self.growth_reserve.store(bytes, Ordering::Relaxed);
    }

    /// Current growth reserve in bytes.
    pub fn growth_reserve(&self) -> usize {
        self.growth_reserve.load(Ordering::Relaxed)
    }

    fn capacity_for(&self, minimum: usize, maximum: Option<usize>, reserved: Option<usize>) -> usize {
        let wanted = minimum.saturating_add(self.growth_reserve());
        let capacity = maximum.map_or(wanted, |max| wanted.min(max)).max(minimum);
        reserved.map_or(capacity, |r| capacity.max(r))
    }
}

// SAFETY: memories returned by `new_memory` satisfy the `LinearMemory`
// contract (see `AdapterMemory`).
#[allow(unsafe_code)]
unsafe impl MemoryCreator for AdapterMemoryCreator {
    fn new_memory(
        &self,
        _ty: MemoryType,
        minimum: usize,
        maximum: Option<usize>,
        reserved_size_in_bytes: Option<usize>,
        guard_size_in_bytes: usize,
    ) -> Result<Box<dyn LinearMemory>, String> {
        if guard_size_in_bytes != 0 {
            return Err(format!(
                "guard regions are not supported by the external region (requested {guard_size_in_bytes} bytes)"
            ));
        }

        let capacity = self.capacity_for(minimum, maximum, reserved_size_in_bytes);
        let base = self
            .allocator
            .zeroed_allocate(1, capacity)
            .map_err(|e| format!("linear memory of {capacity} bytes: {e}"))?;

        debug!(
            minimum,
            capacity,
            base = base.as_ptr() as usize,
            "Linear memory allocated from external region"
        );

        Ok(Box::new(AdapterMemory {
            base,
            size: minimum,
            capacity,
            allocator: Arc::clone(&self.allocator),
        }))
    }
}

impl std::fmt::Debug for AdapterMemoryCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterMemoryCreator")
            .field("growth_reserve", &self.growth_reserve())
            .finish_non_exhaustive()
    }
}

/// A fixed-capacity linear memory block.
struct AdapterMemory {
    base: NonNull<u8>,
    size: usize,
    capacity: usize,
    allocator: Arc<AlignedAllocator>,
}

// SAFETY: the block is exclusively owned by this memory; the runtime
// serialises access through the owning store.
#[allow(unsafe_code)]
unsafe impl Send for AdapterMemory {}
#[allow(unsafe_code)]
unsafe impl Sync for AdapterMemory {}

// SAFETY: `base..base + capacity` is a live, zero-initialised allocation that
// does not move for the lifetime of the memory, and `size <= capacity`.
#[allow(unsafe_code)]
unsafe impl LinearMemory for AdapterMemory {
    fn byte_size(&self) -> usize {
        self.size
    }

    fn byte_capacity(&self) -> usize {
        self.capacity
    }

    fn grow_to(&mut self, new_size: usize) -> wasmtime::Result<()> {
        if new_size > self.capacity {
            return Err(wasmtime::Error::msg(format!(
                "linear memory is fixed at {} bytes, cannot grow to {new_size}",
                self.capacity
            )));
        }
        self.size = new_size;
        Ok(())
    }

    fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl Drop for AdapterMemory {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: `base` came from `zeroed_allocate` on this allocator.
        unsafe { self.allocator.release(Some(self.base)) };
    }
}
