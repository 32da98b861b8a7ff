//! Monotonic bootstrap allocator.

use super::{HeapAllocator, HeapArena, HeapStats};
use core::alloc::Layout;
use core::ptr::NonNull;
use log::{trace, warn};

/// Hands out the arena front to back and never reuses memory.
///
/// Freeing only updates the live-allocation count.
#[derive(Debug)]
pub struct BumpHeap {
    arena: HeapArena,
    /// Offset of the first unused byte.
    next: usize,
    allocations: usize,
}

impl BumpHeap {
    #[must_use]
    pub const fn new(arena: HeapArena) -> Self {
        Self {
            arena,
            next: 0,
            allocations: 0,
        }
    }

    /// Bytes not yet handed out.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.arena.len() - self.next
    }
}

impl HeapAllocator for BumpHeap {
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let base = self.arena.base().addr().get();
        let start = base
            .checked_add(self.next)?
            .checked_next_multiple_of(layout.align())?
            - base;
        let end = start.checked_add(layout.size().max(1))?;
        if end > self.arena.len() {
            warn!("bump heap exhausted: {layout:?} with {} bytes left", self.remaining());
            return None;
        }
        self.next = end;
        self.allocations += 1;
        trace!("bump heap: {} bytes at offset {start:#x}", layout.size());
        // SAFETY: `start < end <= len`.
        NonNull::new(unsafe { self.arena.at(start) })
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        assert!(
            self.arena.offset_of(ptr.as_ptr()).is_some_and(|off| off < self.next),
            "free of {ptr:p}, which this bump heap never handed out"
        );
        assert!(self.allocations > 0, "more frees than allocations on a bump heap");
        self.allocations -= 1;
    }

    fn stats(&self) -> HeapStats {
        HeapStats {
            capacity: self.arena.len(),
            used: self.next,
            allocations: self.allocations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::tests::arena;

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn allocations_advance_and_respect_alignment() {
        let mut heap = BumpHeap::new(arena(1));
        let base = heap.arena.base().addr().get();

        let a = heap.allocate(layout(3, 1)).unwrap();
        let b = heap.allocate(layout(8, 8)).unwrap();
        let c = heap.allocate(layout(1, 256)).unwrap();
        assert_eq!(a.addr().get() - base, 0);
        assert_eq!(b.addr().get() - base, 8);
        assert_eq!(c.addr().get() - base, 256);
        assert_eq!(heap.stats().used, 257);
        assert_eq!(heap.remaining(), 4096 - 257);
    }

    #[test]
    fn exhaustion_leaves_the_cursor_alone() {
        let mut heap = BumpHeap::new(arena(1));
        heap.allocate(layout(4000, 8)).unwrap();
        assert!(heap.allocate(layout(200, 8)).is_none());
        assert_eq!(heap.stats().used, 4000);
        assert!(heap.allocate(layout(96, 8)).is_some());
        assert_eq!(heap.remaining(), 0);
    }

    #[test]
    fn frees_never_make_memory_reusable() {
        let mut heap = BumpHeap::new(arena(1));
        let a = heap.allocate(layout(64, 8)).unwrap();
        unsafe { heap.deallocate(a, layout(64, 8)) };
        let b = heap.allocate(layout(64, 8)).unwrap();
        assert_ne!(a, b);
        assert_eq!(heap.stats().allocations, 1);
    }

    #[test]
    #[should_panic(expected = "never handed out")]
    fn foreign_pointers_are_fatal() {
        let mut heap = BumpHeap::new(arena(1));
        heap.allocate(layout(16, 8)).unwrap();
        let mut outside = 0u8;
        unsafe { heap.deallocate(NonNull::from(&mut outside), layout(1, 1)) };
    }
}
