//! First-fit free list over a range of offsets.
//!
//! Shared by the region allocator (offsets into the external region) and the
//! host-managed guest heap (offsets into guest linear memory). The list only
//! tracks free ranges; callers remember the length of what they took.

use std::collections::BTreeMap;

/// Free ranges keyed by start offset, coalesced on release.
#[derive(Debug)]
pub(crate) struct FreeList {
    free: BTreeMap<usize, usize>,
    capacity: usize,
    used: usize,
}

impl FreeList {
    /// A list whose whole `[0, capacity)` range is free.
    pub(crate) fn new(capacity: usize) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            free,
            capacity,
            used: 0,
        }
    }

    /// Take `len` bytes starting at a multiple of `align`.
    pub(crate) fn take(&mut self, len: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        if len == 0 {
            return None;
        }

        let (block_start, block_len, start) = self.free.iter().find_map(|(&off, &blen)| {
            let start = off.checked_add(align - 1)? & !(align - 1);
            let end = start.checked_add(len)?;
            (end <= off + blen).then_some((off, blen, start))
        })?;

        self.free.remove(&block_start);
        if start > block_start {
            self.free.insert(block_start, start - block_start);
        }
        let tail = block_start + block_len - (start + len);
        if tail > 0 {
            self.free.insert(start + len, tail);
        }

        self.used += len;
        Some(start)
    }

    /// Return a range previously handed out by [`FreeList::take`].
    pub(crate) fn give(&mut self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.capacity);
        self.used -= len;

        let mut start = offset;
        let mut end = offset + len;

        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(next_len) = self.free.remove(&end) {
            end += next_len;
        }

        self.free.insert(start, end - start);
    }

    /// Bytes currently handed out.
    pub(crate) fn used(&self) -> usize {
        self.used
    }

    /// Total size of the managed range.
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of disjoint free ranges.
    #[cfg(test)]
    pub(crate) fn fragments(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_first_fit() {
        let mut list = FreeList::new(100);
        assert_eq!(list.take(10, 1), Some(0));
        assert_eq!(list.take(10, 1), Some(10));
        assert_eq!(list.used(), 20);
    }

    #[test]
    fn test_take_aligned() {
        let mut list = FreeList::new(100);
        assert_eq!(list.take(3, 1), Some(0));
        assert_eq!(list.take(8, 8), Some(8));
        // The 3..8 gap stays available.
        assert_eq!(list.take(5, 1), Some(3));
    }

    #[test]
    fn test_exhaustion() {
        let mut list = FreeList::new(16);
        assert_eq!(list.take(16, 1), Some(0));
        assert_eq!(list.take(1, 1), None);
        assert_eq!(list.take(0, 1), None);
    }

    #[test]
    fn test_give_coalesces() {
        let mut list = FreeList::new(30);
        let a = list.take(10, 1).unwrap();
        let b = list.take(10, 1).unwrap();
        let c = list.take(10, 1).unwrap();

        list.give(a, 10);
        list.give(c, 10);
        assert_eq!(list.fragments(), 2);

        list.give(b, 10);
        assert_eq!(list.fragments(), 1);
        assert_eq!(list.used(), 0);

        // Whole range is usable again.
        assert_eq!(list.take(30, 1), Some(0));
    }

    #[test]
    fn test_empty_list() {
        let mut list = FreeList::new(0);
        assert_eq!(list.capacity(), 0);
        assert_eq!(list.take(1, 1), None);
    }
}
