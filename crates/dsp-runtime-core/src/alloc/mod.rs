//! Host-side memory for the guest runtime.
//!
//! - [`RegionAllocator`]: byte-granular first-fit allocator over a fixed region
//! - [`AlignedAllocator`]: adapter producing 8-byte aligned blocks on top of any
//!   [`BackingAllocator`]

mod aligned;
pub(crate) mod free_list;
mod region;

pub use aligned::{ALIGNMENT, AlignedAllocator};
pub use region::{BackingAllocator, REGION_HEADER, RegionAllocator};
