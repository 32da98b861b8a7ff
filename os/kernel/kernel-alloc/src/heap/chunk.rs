//! First-fit allocator with a header in front of every chunk.

use super::{HeapAllocator, HeapArena, HeapError, HeapStats};
use core::alloc::Layout;
use core::iter;
use core::ptr::{NonNull, null_mut};
use log::{debug, trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
enum ChunkState {
    Free,
    Used,
}

/// Header stored in front of every chunk, free or used.
///
/// Chunks tile the whole arena in address order:
///
/// ```text
/// +-------------+----------------+-------------+----------------+----
/// | ChunkHeader | payload (size) | ChunkHeader | payload (size) | ...
/// +-------------+----------------+-------------+----------------+----
/// ^ arena base                   ^ header.next
/// ```
///
/// No two free chunks are ever adjacent: freeing merges with both neighbors.
#[repr(C, align(16))]
struct ChunkHeader {
    /// Next chunk in address order (or null).
    next: *mut ChunkHeader,
    /// Payload bytes after the header.
    size: usize,
    state: ChunkState,
}

const HEADER: usize = size_of::<ChunkHeader>();

/// Payload granularity. Keeps every header aligned.
const GRANULE: usize = align_of::<ChunkHeader>();

/// Smallest tail worth splitting off into its own free chunk.
const MIN_SPLIT: usize = HEADER + GRANULE;

/// Header at `addr`.
///
/// Only ever called with addresses that are multiples of [`GRANULE`].
#[allow(clippy::cast_ptr_alignment)]
const fn header_at(addr: *mut u8) -> *mut ChunkHeader {
    addr.cast::<ChunkHeader>()
}

/// First byte of the payload behind `chunk`.
const fn payload(chunk: *mut ChunkHeader) -> *mut u8 {
    chunk.cast::<u8>().wrapping_add(HEADER)
}

/// A first-fit, split-and-coalesce heap.
///
/// # Invariants
/// - The chunk chain starts at the arena base and covers the arena exactly.
/// - Every header and payload is [`GRANULE`]-aligned.
/// - No two adjacent chunks are both free.
pub struct ChunkHeap {
    arena: HeapArena,
    first: *mut ChunkHeader,
    used: usize,
    allocations: usize,
}

// SAFETY: the chunk pointers all point into the exclusively owned arena.
unsafe impl Send for ChunkHeap {}

impl ChunkHeap {
    /// Format `arena` as one free chunk.
    ///
    /// # Errors
    /// - [`HeapError::Unaligned`] if the base is not 16-byte aligned.
    /// - [`HeapError::ArenaTooSmall`] if it cannot hold a header and one granule.
    pub fn new(arena: HeapArena) -> Result<Self, HeapError> {
        if !arena.base().addr().get().is_multiple_of(GRANULE) {
            return Err(HeapError::Unaligned(GRANULE));
        }
        let len = arena.len() - arena.len() % GRANULE;
        if len < MIN_SPLIT {
            return Err(HeapError::ArenaTooSmall(arena.len()));
        }
        let first = header_at(arena.base().as_ptr());
        // SAFETY: the arena is exclusively ours and large enough.
        unsafe {
            first.write(ChunkHeader {
                next: null_mut(),
                size: len - HEADER,
                state: ChunkState::Free,
            });
        }
        debug!("chunk heap over {arena:?}");
        Ok(Self {
            arena,
            first,
            used: 0,
            allocations: 0,
        })
    }

    fn chunks(&self) -> impl Iterator<Item = &ChunkHeader> + '_ {
        // SAFETY: the chain only links headers inside the arena.
        iter::successors(NonNull::new(self.first), |c| NonNull::new(unsafe { c.as_ref() }.next))
            .map(|c| unsafe { c.as_ref() })
    }

    /// Number of free chunks, a measure of fragmentation.
    #[must_use]
    pub fn free_chunks(&self) -> usize {
        self.chunks().filter(|c| c.state == ChunkState::Free).count()
    }

    /// Largest payload a single allocation could currently get.
    #[must_use]
    pub fn largest_free(&self) -> usize {
        self.chunks()
            .filter(|c| c.state == ChunkState::Free)
            .map(|c| c.size)
            .max()
            .unwrap_or(0)
    }

    /// Try to place `size` bytes aligned to `align` in the free chunk `chunk`.
    ///
    /// # Safety
    /// `chunk` must be a free chunk of this heap.
    unsafe fn carve(&mut self, chunk: *mut ChunkHeader, size: usize, align: usize) -> Option<NonNull<u8>> {
        let start = chunk.addr();
        let end = payload(chunk).addr() + unsafe { (*chunk).size };

        let mut target = chunk;
        if !payload(chunk).addr().is_multiple_of(align) {
            // Leading padding stays behind as a free chunk of its own.
            let aligned = (payload(chunk).addr() + HEADER).checked_next_multiple_of(align)?;
            if aligned.checked_add(size)? > end {
                return None;
            }
            target = header_at(chunk.cast::<u8>().wrapping_add(aligned - HEADER - start));
            unsafe {
                target.write(ChunkHeader {
                    next: (*chunk).next,
                    size: end - aligned,
                    state: ChunkState::Free,
                });
                (*chunk).next = target;
                (*chunk).size = aligned - HEADER - start - HEADER;
            }
        } else if size > unsafe { (*chunk).size } {
            return None;
        }

        let c = unsafe { &mut *target };
        if c.size - size >= MIN_SPLIT {
            let tail = header_at(payload(target).wrapping_add(size));
            unsafe {
                tail.write(ChunkHeader {
                    next: c.next,
                    size: c.size - size - HEADER,
                    state: ChunkState::Free,
                });
            }
            c.next = tail;
            c.size = size;
        }
        c.state = ChunkState::Used;
        self.used += c.size;
        self.allocations += 1;
        NonNull::new(payload(target))
    }
}

impl HeapAllocator for ChunkHeap {
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let size = layout.size().max(1).checked_next_multiple_of(GRANULE)?;
        let align = layout.align().max(GRANULE);

        let mut cur = self.first;
        while !cur.is_null() {
            // SAFETY: `cur` is a header of the chain.
            if unsafe { (*cur).state } == ChunkState::Free
                && let Some(ptr) = unsafe { self.carve(cur, size, align) }
            {
                trace!("chunk heap: {size} bytes at {ptr:p}");
                return Some(ptr);
            }
            cur = unsafe { (*cur).next };
        }
        warn!(
            "chunk heap exhausted: {layout:?}, largest free chunk {} bytes",
            self.largest_free()
        );
        None
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        let ptr = ptr.as_ptr();
        assert!(self.arena.contains(ptr), "free of {ptr:p} outside the heap arena");

        let mut prev: *mut ChunkHeader = null_mut();
        let mut cur = self.first;
        while !cur.is_null() && payload(cur).addr() < ptr.addr() {
            prev = cur;
            cur = unsafe { (*cur).next };
        }
        if cur.is_null() || payload(cur) != ptr {
            panic!("free of {ptr:p}, which is not an allocated chunk");
        }

        // SAFETY: `cur`, `prev` and `next` are headers of the chain.
        unsafe {
            let c = &mut *cur;
            assert!(c.state == ChunkState::Used, "double free of heap chunk at {ptr:p}");
            c.state = ChunkState::Free;
            self.used -= c.size;
            self.allocations -= 1;

            let next = c.next;
            if !next.is_null() && (*next).state == ChunkState::Free {
                c.size += HEADER + (*next).size;
                c.next = (*next).next;
            }
            if !prev.is_null() && (*prev).state == ChunkState::Free {
                (*prev).size += HEADER + c.size;
                (*prev).next = c.next;
            }
        }
        trace!("chunk heap: freed {ptr:p}");
    }

    fn stats(&self) -> HeapStats {
        HeapStats {
            capacity: self.arena.len(),
            used: self.used,
            allocations: self.allocations,
        }
    }
}

impl core::fmt::Debug for ChunkHeap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChunkHeap")
            .field("arena", &self.arena)
            .field("used", &self.used)
            .field("allocations", &self.allocations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::tests::arena;
    use alloc::vec::Vec;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn header_keeps_payloads_aligned() {
        assert_eq!(HEADER % GRANULE, 0);
        assert_eq!(GRANULE, 16);
    }

    #[test]
    fn allocation_splits_off_the_tail() {
        let mut heap = ChunkHeap::new(arena(1)).unwrap();
        let base = heap.arena.base().as_ptr();

        let a = heap.allocate(layout(50, 8)).unwrap();
        assert_eq!(a.as_ptr(), base.wrapping_add(HEADER));
        assert_eq!(heap.stats().used, 64);
        assert_eq!(heap.free_chunks(), 1);
        assert_eq!(heap.largest_free(), 4096 - 2 * HEADER - 64);
    }

    #[test]
    fn first_fit_reuses_the_lowest_hole() {
        let mut heap = ChunkHeap::new(arena(1)).unwrap();
        let a = heap.allocate(layout(64, 8)).unwrap();
        let b = heap.allocate(layout(64, 8)).unwrap();
        let _c = heap.allocate(layout(64, 8)).unwrap();
        unsafe { heap.deallocate(b, layout(64, 8)) };

        let d = heap.allocate(layout(32, 8)).unwrap();
        assert_eq!(d, b);
        assert!(a < d);
    }

    #[test]
    fn freeing_coalesces_with_both_neighbors() {
        let mut heap = ChunkHeap::new(arena(1)).unwrap();
        let l = layout(100, 8);
        let [a, b, c] = [(); 3].map(|()| heap.allocate(l).unwrap());

        unsafe {
            heap.deallocate(a, l);
            heap.deallocate(c, l);
        }
        assert_eq!(heap.free_chunks(), 2);
        unsafe { heap.deallocate(b, l) };

        assert_eq!(heap.free_chunks(), 1);
        assert_eq!(heap.largest_free(), 4096 - HEADER);
        assert_eq!(heap.stats(), HeapStats { capacity: 4096, used: 0, allocations: 0 });
        assert!(heap.allocate(layout(4096 - HEADER, 16)).is_some());
    }

    #[test]
    fn large_alignment_leaves_a_free_lead_chunk() {
        let mut heap = ChunkHeap::new(arena(2)).unwrap();
        let p = heap.allocate(layout(8, 256)).unwrap();
        assert_eq!(p.addr().get() % 256, 0);
        assert_eq!(heap.free_chunks(), 2);

        let small = heap.allocate(layout(16, 8)).unwrap();
        assert!(small < p, "the lead chunk is reused first");

        unsafe {
            heap.deallocate(small, layout(16, 8));
            heap.deallocate(p, layout(8, 256));
        }
        assert_eq!(heap.free_chunks(), 1);
        assert_eq!(heap.largest_free(), 2 * 4096 - HEADER);
    }

    #[test]
    fn exhaustion_returns_none_and_recovers() {
        let mut heap = ChunkHeap::new(arena(1)).unwrap();
        let l = layout(200, 8);
        let mut live = Vec::new();
        while let Some(p) = heap.allocate(l) {
            live.push(p);
        }
        assert!(!live.is_empty());
        assert_eq!(heap.stats().allocations, live.len());

        let last = live.pop().unwrap();
        unsafe { heap.deallocate(last, l) };
        assert_eq!(heap.allocate(l), Some(last));
    }

    #[test]
    fn double_free_is_fatal_and_leaves_the_heap_intact() {
        let mut heap = ChunkHeap::new(arena(1)).unwrap();
        let a = heap.allocate(layout(64, 8)).unwrap();
        let _b = heap.allocate(layout(64, 8)).unwrap();
        unsafe { heap.deallocate(a, layout(64, 8)) };
        let before = heap.stats();

        let result = catch_unwind(AssertUnwindSafe(|| unsafe { heap.deallocate(a, layout(64, 8)) }));
        assert!(result.is_err());
        assert_eq!(heap.stats(), before);
    }

    #[test]
    #[should_panic(expected = "not an allocated chunk")]
    fn interior_pointers_are_fatal() {
        let mut heap = ChunkHeap::new(arena(1)).unwrap();
        let a = heap.allocate(layout(64, 8)).unwrap();
        unsafe { heap.deallocate(NonNull::new(a.as_ptr().wrapping_add(16)).unwrap(), layout(8, 8)) };
    }

    #[test]
    #[should_panic(expected = "outside the heap arena")]
    fn foreign_pointers_are_fatal() {
        let mut heap = ChunkHeap::new(arena(1)).unwrap();
        let mut outside = [0u8; 16];
        unsafe { heap.deallocate(NonNull::from(&mut outside).cast(), layout(16, 1)) };
    }

    #[test]
    fn arena_requirements() {
        let a = arena(1);
        let skewed = unsafe {
            HeapArena::from_raw_parts(NonNull::new(a.base().as_ptr().wrapping_add(8)).unwrap(), 128)
        };
        assert_eq!(ChunkHeap::new(skewed).unwrap_err(), HeapError::Unaligned(16));
        let tiny = unsafe { HeapArena::from_raw_parts(a.base(), 40) };
        assert_eq!(ChunkHeap::new(tiny).unwrap_err(), HeapError::ArenaTooSmall(40));
    }
}
