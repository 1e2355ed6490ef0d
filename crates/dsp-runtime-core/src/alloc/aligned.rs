//! Aligned allocator adapter.
//!
//! The guest runtime requires 8-byte aligned memory, while the backing
//! allocator returns byte-granular addresses. [`AlignedAllocator`]
//! over-allocates, rounds the address up, and records in front of the
//! returned address what it needs to undo the adjustment:
//!
//! ```text
//!  raw                              aligned (returned)
//!  │ slack │ requested size │ raw ptr │ payload ...
//!          └─── header (2 words) ─────┘
//! ```
//!
//! The word immediately preceding the returned address is always the raw
//! pointer handed back to the backing allocator on release. The word before
//! it is the requested size, used by [`AlignedAllocator::reallocate`] to copy
//! no more than the old block actually holds.

use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dsp_runtime_common::AllocError;
use tracing::{debug, trace};

use super::BackingAllocator;

/// Alignment of every address returned by the adapter.
pub const ALIGNMENT: usize = 8;

const WORD: usize = size_of::<usize>();
const HEADER: usize = 2 * WORD;
const SLACK: usize = ALIGNMENT - 1;

/// Aligned allocations on top of a byte-granular [`BackingAllocator`].
///
/// All methods are callable from any thread; synchronisation is the backing
/// allocator's responsibility.
pub struct AlignedAllocator {
    backing: Arc<dyn BackingAllocator>,
    live: AtomicUsize,
}

impl AlignedAllocator {
    /// Wrap a backing allocator.
    pub fn new(backing: Arc<dyn BackingAllocator>) -> Self {
        Self {
            backing,
            live: AtomicUsize::new(0),
        }
    }

    /// Allocate `size` bytes aligned to [`ALIGNMENT`].
    ///
    /// Contents are uninitialized.
    #[allow(unsafe_code)]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = size
            .checked_add(HEADER + SLACK)
            .ok_or(AllocError::Exhausted { requested: size })?;
        let raw = self
            .backing
            .malloc(total)
            .ok_or(AllocError::Exhausted { requested: size })?;

        let raw_addr = raw.as_ptr() as usize;
        let offset = align_up(raw_addr + HEADER, ALIGNMENT) - raw_addr;
        debug_assert!(offset >= HEADER && offset <= HEADER + SLACK);

        // SAFETY: `offset + size <= total`, so the header words and the
        // payload are inside the block the backing allocator just returned.
        // `aligned` is a multiple of ALIGNMENT >= align_of::<usize>().
        let aligned = unsafe {
            let aligned = raw.as_ptr().add(offset);
            aligned.cast::<*mut u8>().sub(1).write(raw.as_ptr());
            aligned.cast::<usize>().sub(2).write(size);
            NonNull::new_unchecked(aligned)
        };

        self.live.fetch_add(1, Ordering::Relaxed);
        trace!(size, raw = raw_addr, aligned = aligned.as_ptr() as usize, "allocate");
        Ok(aligned)
    }

    /// Release a block. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this adapter and not released since.
    /// Releasing the same block twice is undefined.
    #[allow(unsafe_code)]
    pub unsafe fn release(&self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };

        // SAFETY: caller contract; the header was written by `allocate`.
        unsafe {
            let raw = Self::raw_of(ptr);
            self.backing.free(raw);
        }
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Resize a block.
    ///
    /// - `ptr == None` behaves like [`AlignedAllocator::allocate`].
    /// - `size == 0` releases `ptr` and returns `Ok(None)`.
    /// - Otherwise a new block is allocated, `min(old, size)` bytes are copied,
    ///   and the old block is released. On failure the old block is untouched.
    ///
    /// # Safety
    ///
    /// Same as [`AlignedAllocator::release`].
    #[allow(unsafe_code)]
    pub unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(old) = ptr else {
            return self.allocate(size).map(Some);
        };
        if size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.release(Some(old)) };
            return Ok(None);
        }

        let new = self.allocate(size)?;
        // SAFETY: both blocks are live and distinct; `old_size` is what the
        // old block was allocated with, so the copy stays inside it.
        unsafe {
            let old_size = Self::size_of_block(old);
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(size));
            self.release(Some(old));
        }
        Ok(Some(new))
    }

    /// Allocate `count * size` zeroed bytes.
    #[allow(unsafe_code)]
    pub fn zeroed_allocate(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count
            .checked_mul(size)
            .ok_or(AllocError::Overflow { count, size })?;
        let ptr = self.allocate(total)?;
        // SAFETY: `ptr` points to `total` freshly allocated bytes.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Ok(ptr)
    }

    /// Requested size of a live block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block returned by this adapter.
    #[allow(unsafe_code)]
    pub unsafe fn size_of_block(ptr: NonNull<u8>) -> usize {
        // SAFETY: caller contract; see the header layout in the module docs.
        unsafe { ptr.as_ptr().cast::<usize>().sub(2).read() }
    }

    #[allow(unsafe_code)]
    unsafe fn raw_of(ptr: NonNull<u8>) -> NonNull<u8> {
        // SAFETY: caller contract; the slot holds the non-null raw pointer.
        unsafe { NonNull::new_unchecked(ptr.as_ptr().cast::<*mut u8>().sub(1).read()) }
    }

    /// Number of blocks handed out and not yet released.
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Allocate and release a 1 KiB block to prove the region is usable.
    ///
    /// Run once at startup before the guest runtime is bootstrapped.
    #[allow(unsafe_code)]
    pub fn self_test(&self) -> Result<(), AllocError> {
        let ptr = self.allocate(1024)?;
        debug_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        debug!(addr = ptr.as_ptr() as usize, "Allocator self-test allocation succeeded");
        // SAFETY: `ptr` was just allocated above.
        unsafe { self.release(Some(ptr)) };
        debug!("Allocator self-test release succeeded");
        Ok(())
    }
}

impl std::fmt::Debug for AlignedAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedAllocator")
            .field("alignment", &ALIGNMENT)
            .field("live", &self.live_allocations())
            .finish_non_exhaustive()
    }
}

const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}
