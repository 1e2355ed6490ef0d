//! Backing allocator over a fixed external memory region.
//!
//! [`RegionAllocator`] stands in for the external RAM manager of the target
//! board: a fixed-capacity region handed out with first-fit placement. Like
//! the board allocator it keeps a 20-byte record in front of every block, so
//! the addresses it returns are byte-granular and generally not 8-aligned.
//! [`super::AlignedAllocator`] corrects that for the guest runtime.

use std::ptr::{self, NonNull};

use parking_lot::Mutex;
use tracing::debug;

use super::free_list::FreeList;

/// Size of the record stored in front of each region block.
pub const REGION_HEADER: usize = 20;

const REGION_MAGIC: u32 = 0x5D4A_11C0;

/// A raw, byte-granular memory source.
///
/// # Safety
///
/// `malloc(size)` must return either `None` or a pointer to `size` writable
/// bytes that stay valid and unaliased until passed to `free`.
pub unsafe trait BackingAllocator: Send + Sync {
    /// Allocate `size` bytes with no alignment guarantee.
    fn malloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Release a block.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `malloc` on this allocator and not
    /// released since.
    unsafe fn free(&self, ptr: NonNull<u8>);
}

/// First-fit allocator over a fixed-capacity region.
pub struct RegionAllocator {
    base: NonNull<u8>,
    capacity: usize,
    state: Mutex<RegionState>,
}

#[derive(Debug)]
struct RegionState {
    blocks: FreeList,
    live: usize,
}

// SAFETY: `base` is owned by the allocator and only reached through blocks
// handed out under the `state` lock; blocks never overlap.
#[allow(unsafe_code)]
unsafe impl Send for RegionAllocator {}
#[allow(unsafe_code)]
unsafe impl Sync for RegionAllocator {}

impl RegionAllocator {
    /// Reserve a region of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let region: Box<[u8]> = vec![0u8; capacity].into_boxed_slice();
        let base = NonNull::from(Box::leak(region)).cast::<u8>();

        debug!(capacity, "External memory region reserved");

        Self {
            base,
            capacity,
            state: Mutex::new(RegionState {
                blocks: FreeList::new(capacity),
                live: 0,
            }),
        }
    }

    /// Total region size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently handed out, including block records.
    pub fn used(&self) -> usize {
        self.state.lock().blocks.used()
    }

    /// Number of blocks not yet released.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().live
    }

    fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.capacity
    }
}

#[allow(unsafe_code)]
unsafe impl BackingAllocator for RegionAllocator {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        let total = size.checked_add(REGION_HEADER)?;
        let offset = {
            let mut state = self.state.lock();
            let offset = state.blocks.take(total, 1)?;
            state.live += 1;
            offset
        };

        // SAFETY: `offset + total <= capacity`, and the block was just removed
        // from the free list so nothing else refers to it.
        unsafe {
            let block = self.base.as_ptr().add(offset);
            ptr::write_unaligned(block.cast::<usize>(), total);
            ptr::write_unaligned(block.add(size_of::<usize>()).cast::<u32>(), REGION_MAGIC);
            NonNull::new(block.add(REGION_HEADER))
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        debug_assert!(self.contains(ptr.as_ptr() as usize));

        // SAFETY: caller guarantees `ptr` came from `malloc`, so the record
        // lies `REGION_HEADER` bytes before it inside the region.
        let (block, total) = unsafe {
            let block = ptr.as_ptr().sub(REGION_HEADER);
            let magic = ptr::read_unaligned(block.add(size_of::<usize>()).cast::<u32>());
            debug_assert_eq!(magic, REGION_MAGIC, "free of a foreign or corrupted block");
            (block, ptr::read_unaligned(block.cast::<usize>()))
        };

        let offset = block as usize - self.base.as_ptr() as usize;
        let mut state = self.state.lock();
        state.blocks.give(offset, total);
        state.live -= 1;
    }
}

impl Drop for RegionAllocator {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: `base`/`capacity` describe the boxed slice leaked in `new`.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.base.as_ptr(),
                self.capacity,
            )));
        }
    }
}

impl std::fmt::Debug for RegionAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RegionAllocator")
            .field("capacity", &self.capacity)
            .field("used", &state.blocks.used())
            .field("live", &state.live)
            .finish_non_exhaustive()
    }
}
