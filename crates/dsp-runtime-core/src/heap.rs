//! Guest-side allocator for transient call buffers.
//!
//! Buffers handed to the entry point live in the guest's linear memory and are
//! addressed by offset. Three strategies are supported, chosen once at
//! instantiation:
//!
//! - [`HeapKind::Host`]: a fixed heap appended to the end of linear memory and
//!   managed entirely on the host. Bookkeeping never lives in guest memory.
//! - [`HeapKind::Exports`]: the module's own `malloc`/`free` exports.
//! - [`HeapKind::None`]: no heap; buffer calls fail per call.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};
use wasmtime::{Instance, Memory, Store, TypedFunc};

use dsp_runtime_common::RuntimeError;

use crate::alloc::ALIGNMENT;
use crate::alloc::free_list::FreeList;
use crate::store::GuestState;

/// Size of a WebAssembly page.
pub const WASM_PAGE: usize = 64 * 1024;

/// Which allocator backs guest buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    /// Host-managed heap at the end of linear memory.
    Host,
    /// The module's `malloc`/`free` exports.
    Exports,
    /// No heap available.
    None,
}

impl fmt::Display for HeapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapKind::Host => write!(f, "host"),
            HeapKind::Exports => write!(f, "exports"),
            HeapKind::None => write!(f, "none"),
        }
    }
}

/// Snapshot of guest heap usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Active strategy.
    pub kind: HeapKind,
    /// Blocks not yet released.
    pub live_allocations: usize,
    /// Bytes held by those blocks.
    pub outstanding_bytes: usize,
}

/// Number of pages needed to hold `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(WASM_PAGE)
}

/// Linear memory growth to reserve for a host heap of `heap_budget` bytes.
///
/// Covers the heap plus the alignment gap in front of it.
pub const fn growth_for_heap(heap_budget: usize) -> usize {
    if heap_budget == 0 {
        0
    } else {
        pages_for(heap_budget + ALIGNMENT) * WASM_PAGE
    }
}

pub(crate) enum GuestHeap {
    Host(HostHeap),
    Exports(ExportHeap),
    None,
}

pub(crate) struct HostHeap {
    base: u32,
    blocks: FreeList,
    live: BTreeMap<u32, u32>,
}

pub(crate) struct ExportHeap {
    malloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
    live: BTreeMap<u32, u32>,
}

impl GuestHeap {
    /// Set up the guest heap for a freshly created instance.
    ///
    /// Linear memory is frozen at its final size afterwards.
    pub(crate) fn setup(
        store: &mut Store<GuestState>,
        instance: &Instance,
        memory: Option<Memory>,
        heap_budget: usize,
    ) -> Result<Self, RuntimeError> {
        let Some(memory) = memory else {
            if heap_budget > 0 {
                warn!(heap_budget, "Module exports no memory; guest heap disabled");
            }
            return Ok(GuestHeap::None);
        };

        let heap = if heap_budget > 0 {
            GuestHeap::Host(HostHeap::append(store, memory, heap_budget)?)
        } else {
            match (
                instance.get_typed_func::<u32, u32>(&mut *store, "malloc"),
                instance.get_typed_func::<u32, ()>(&mut *store, "free"),
            ) {
                (Ok(malloc), Ok(free)) => {
                    debug!("Guest heap delegated to module exports");
                    GuestHeap::Exports(ExportHeap {
                        malloc,
                        free,
                        live: BTreeMap::new(),
                    })
                }
                _ => {
                    warn!("No heap budget and no malloc/free exports; buffer calls will fail");
                    GuestHeap::None
                }
            }
        };

        let size = memory.data_size(&*store);
        store.data_mut().freeze_memory(size);

        Ok(heap)
    }

    /// Allocate `bytes` in guest memory. Returns the offset, or `None` when
    /// the heap cannot satisfy the request.
    pub(crate) fn alloc(&mut self, store: &mut Store<GuestState>, bytes: usize) -> Option<u32> {
        match self {
            GuestHeap::Host(heap) => heap.alloc(bytes),
            GuestHeap::Exports(heap) => heap.alloc(store, bytes),
            GuestHeap::None => None,
        }
    }

    /// Release a block returned by [`GuestHeap::alloc`].
    pub(crate) fn free(&mut self, store: &mut Store<GuestState>, offset: u32) {
        match self {
            GuestHeap::Host(heap) => heap.free(offset),
            GuestHeap::Exports(heap) => heap.free(store, offset),
            GuestHeap::None => {}
        }
    }

    pub(crate) fn stats(&self) -> HeapStats {
        let (kind, live) = match self {
            GuestHeap::Host(heap) => (HeapKind::Host, Some(&heap.live)),
            GuestHeap::Exports(heap) => (HeapKind::Exports, Some(&heap.live)),
            GuestHeap::None => (HeapKind::None, None),
        };
        HeapStats {
            kind,
            live_allocations: live.map_or(0, BTreeMap::len),
            outstanding_bytes: live.map_or(0, |l| l.values().map(|&len| len as usize).sum()),
        }
    }
}

impl HostHeap {
    /// Grow `memory` once and place a heap of `heap_budget` bytes at its end.
    fn append(
        store: &mut Store<GuestState>,
        memory: Memory,
        heap_budget: usize,
    ) -> Result<Self, RuntimeError> {
        let old_size = memory.data_size(&*store);
        // Offset 0 is never handed out.
        let base = old_size.max(ALIGNMENT).next_multiple_of(ALIGNMENT);
        let end = base
            .checked_add(heap_budget)
            .filter(|&end| u32::try_from(end).is_ok())
            .ok_or_else(|| {
                RuntimeError::instantiation(format!(
                    "heap of {heap_budget} bytes does not fit in 32-bit linear memory"
                ))
            })?;

        let delta = pages_for(end).saturating_sub(pages_for(old_size));
        if delta > 0 {
            memory.grow(&mut *store, delta as u64).map_err(|e| {
                RuntimeError::instantiation(format!(
                    "cannot grow linear memory by {delta} pages for the guest heap: {e}"
                ))
            })?;
        }

        debug!(
            base,
            heap_budget,
            grown_pages = delta,
            "Host-managed guest heap placed"
        );

        Ok(Self {
            base: u32::try_from(base).map_err(|_| {
                RuntimeError::instantiation("guest heap base exceeds 32-bit linear memory")
            })?,
            blocks: FreeList::new(heap_budget),
            live: BTreeMap::new(),
        })
    }

    fn alloc(&mut self, bytes: usize) -> Option<u32> {
        let len = u32::try_from(bytes).ok()?;
        let relative = self.blocks.take(bytes, ALIGNMENT)?;
        let offset = self.base + u32::try_from(relative).ok()?;
        self.live.insert(offset, len);
        Some(offset)
    }

    fn free(&mut self, offset: u32) {
        if let Some(len) = self.live.remove(&offset) {
            self.blocks
                .give((offset - self.base) as usize, len as usize);
        } else {
            warn!(offset, "Release of unknown guest heap block ignored");
        }
    }
}

impl ExportHeap {
    fn alloc(&mut self, store: &mut Store<GuestState>, bytes: usize) -> Option<u32> {
        let len = u32::try_from(bytes).ok()?;
        match self.malloc.call(&mut *store, len) {
            Ok(0) => None,
            Ok(offset) => {
                self.live.insert(offset, len);
                Some(offset)
            }
            Err(e) => {
                debug!(error = %e, "Guest malloc trapped");
                None
            }
        }
    }

    fn free(&mut self, store: &mut Store<GuestState>, offset: u32) {
        if self.live.remove(&offset).is_none() {
            warn!(offset, "Release of unknown guest heap block ignored");
            return;
        }
        if let Err(e) = self.free.call(&mut *store, offset) {
            warn!(offset, error = %e, "Guest free trapped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_heap(budget: usize) -> HostHeap {
        HostHeap {
            base: 65536,
            blocks: FreeList::new(budget),
            live: BTreeMap::new(),
        }
    }

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(WASM_PAGE), 1);
        assert_eq!(pages_for(WASM_PAGE + 1), 2);
    }

    #[test]
    fn test_growth_for_heap() {
        assert_eq!(growth_for_heap(0), 0);
        assert_eq!(growth_for_heap(16 * 1024), WASM_PAGE);
        // The alignment gap can push an exact page over the edge.
        assert_eq!(growth_for_heap(WASM_PAGE), 2 * WASM_PAGE);
    }

    #[test]
    fn test_host_heap_offsets_aligned_and_in_range() {
        let mut heap = host_heap(1024);
        let a = heap.alloc(3).unwrap();
        let b = heap.alloc(5).unwrap();

        assert_eq!(a as usize % ALIGNMENT, 0);
        assert_eq!(b as usize % ALIGNMENT, 0);
        assert!(a >= 65536 && b < 65536 + 1024);
        assert_ne!(a, b);
    }

    #[test]
    fn test_host_heap_exhaustion_and_reuse() {
        let mut heap = host_heap(1024);
        let a = heap.alloc(512).unwrap();
        let b = heap.alloc(512).unwrap();
        assert!(heap.alloc(8).is_none());

        heap.free(a);
        heap.free(b);
        assert!(heap.live.is_empty());
        assert_eq!(heap.blocks.used(), 0);
        assert!(heap.alloc(1024).is_some());
    }

    #[test]
    fn test_host_heap_unknown_free_ignored() {
        let mut heap = host_heap(256);
        let a = heap.alloc(64).unwrap();
        heap.free(a + 8);
        assert_eq!(heap.live.len(), 1);
        heap.free(a);
        assert!(heap.live.is_empty());
    }

    #[test]
    fn test_heap_kind_display() {
        assert_eq!(HeapKind::Host.to_string(), "host");
        assert_eq!(HeapKind::Exports.to_string(), "exports");
        assert_eq!(HeapKind::None.to_string(), "none");
    }

    #[test]
    fn test_stats() {
        let mut heap = GuestHeap::Host(host_heap(1024));
        if let GuestHeap::Host(h) = &mut heap {
            h.alloc(100).unwrap();
        }
        let stats = heap.stats();
        assert_eq!(stats.kind, HeapKind::Host);
        assert_eq!(stats.live_allocations, 1);
        assert_eq!(stats.outstanding_bytes, 100);

        assert_eq!(GuestHeap::None.stats().live_allocations, 0);
    }
}
