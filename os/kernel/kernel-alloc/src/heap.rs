//! # Heap Allocators
//!
//! Allocation policy on top of one virtual range, the [`HeapArena`], that the
//! address-space manager maps once (see
//! [`Vmm::allocate_kernel_heap`](crate::vmm::Vmm::allocate_kernel_heap)).
//! The allocators never call into the PMM or a [`Vmm`](crate::vmm::Vmm)
//! themselves.
//!
//! * [`BumpHeap`]: monotonic pointer advance, no reuse. For early bootstrap.
//! * [`ChunkHeap`]: first-fit over embedded chunk headers, with splitting
//!   and coalescing.
//! * [`SlabHeap`]: fixed-size objects tracked by an occupancy bitmap.
//!
//! [`LockedHeap`] wraps any of them behind an [`IrqSpinLock`] and implements
//! [`GlobalAlloc`]:
//!
//! ```ignore
//! #[global_allocator]
//! static HEAP: LockedHeap<ChunkHeap> = LockedHeap::empty();
//!
//! let arena = kernel_space.allocate_kernel_heap(16 * 1024 * 1024)?;
//! HEAP.init(ChunkHeap::new(arena)?);
//! ```

mod bump;
mod chunk;
mod slab;

pub use bump::BumpHeap;
pub use chunk::ChunkHeap;
pub use slab::SlabHeap;

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{NonNull, null_mut};
use kernel_sync::IrqSpinLock;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("arena of {0} bytes is too small")]
    ArenaTooSmall(usize),
    #[error("arena base is not aligned to {0} bytes")]
    Unaligned(usize),
    #[error("invalid object size {size} or alignment {align}")]
    InvalidObject { size: usize, align: usize },
}

/// A mapped, writable virtual range handed to exactly one heap allocator.
pub struct HeapArena {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the arena is exclusively owned memory; moving the owner between
// CPUs moves the right to use it.
unsafe impl Send for HeapArena {}

impl HeapArena {
    /// # Safety
    /// `[base, base + len)` must stay mapped read/write for as long as the
    /// arena and every allocation made from it live, and nothing else may
    /// access it.
    #[must_use]
    pub const unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `true` if `ptr` points into the arena.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        ptr.addr()
            .checked_sub(self.base.addr().get())
            .is_some_and(|off| off < self.len)
    }

    /// Pointer `offset` bytes into the arena.
    ///
    /// # Safety
    /// `offset` must not exceed [`len`](Self::len).
    #[inline]
    const unsafe fn at(&self, offset: usize) -> *mut u8 {
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Byte offset of `ptr` from the base; `None` if it lies outside.
    fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        self.contains(ptr)
            .then(|| ptr.addr() - self.base.addr().get())
    }
}

impl fmt::Debug for HeapArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapArena({:p}, {:#x} bytes)", self.base, self.len)
    }
}

/// What a heap has handed out.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct HeapStats {
    /// Bytes of the arena the policy manages.
    pub capacity: usize,
    /// Bytes currently handed out, including rounding and alignment padding.
    pub used: usize,
    /// Live allocations.
    pub allocations: usize,
}

impl HeapStats {
    #[must_use]
    pub const fn free(&self) -> usize {
        self.capacity.saturating_sub(self.used)
    }
}

/// An allocation policy over a [`HeapArena`].
pub trait HeapAllocator {
    /// A block of at least `layout.size()` bytes aligned to `layout.align()`,
    /// or `None` if the arena cannot satisfy it.
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return a block to the heap.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this heap with
    /// the same `layout` and must not be used afterwards.
    ///
    /// # Panics
    /// Implementations panic on a pointer they never handed out and on a
    /// double free.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);

    fn stats(&self) -> HeapStats;
}

/// A heap policy behind an interrupt-safe lock, usable as the
/// `#[global_allocator]`.
///
/// Starts empty; every allocation fails until [`init`](Self::init) installs
/// the heap.
pub struct LockedHeap<H>(IrqSpinLock<Option<H>>);

impl<H: HeapAllocator> LockedHeap<H> {
    #[must_use]
    pub const fn empty() -> Self {
        Self(IrqSpinLock::new(None))
    }

    #[must_use]
    pub const fn new(heap: H) -> Self {
        Self(IrqSpinLock::new(Some(heap)))
    }

    /// Install `heap`.
    ///
    /// # Panics
    /// If a heap is already installed: its allocations would be orphaned.
    pub fn init(&self, heap: H) {
        let mut slot = self.0.lock();
        assert!(slot.is_none(), "heap initialized twice");
        *slot = Some(heap);
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.0.lock().is_some()
    }

    /// Statistics of the installed heap.
    #[must_use]
    pub fn stats(&self) -> Option<HeapStats> {
        self.0.lock().as_ref().map(H::stats)
    }
}

impl<H: HeapAllocator> fmt::Debug for LockedHeap<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockedHeap").field(&self.stats()).finish()
    }
}

unsafe impl<H: HeapAllocator + Send> GlobalAlloc for LockedHeap<H> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0
            .lock()
            .as_mut()
            .and_then(|heap| heap.allocate(layout))
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let mut slot = self.0.lock();
        let Some(heap) = slot.as_mut() else {
            panic!("free of {ptr:p} before the heap was initialized");
        };
        // SAFETY: forwarded from the caller.
        unsafe { heap.deallocate(ptr, layout) };
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    #[repr(C, align(4096))]
    struct Page([u8; 4096]);

    /// A leaked, page-aligned host buffer of `pages` pages.
    pub(crate) fn arena(pages: usize) -> HeapArena {
        let buf: Box<[Page]> = (0..pages).map(|_| Page([0; 4096])).collect();
        let base = NonNull::from(Box::leak(buf)).cast::<u8>();
        // SAFETY: leaked, so valid and exclusive for the rest of the test run.
        unsafe { HeapArena::from_raw_parts(base, pages * 4096) }
    }

    #[test]
    fn arena_contains_is_half_open() {
        let a = arena(1);
        let base = a.base().as_ptr();
        assert!(a.contains(base));
        assert!(a.contains(base.wrapping_add(4095)));
        assert!(!a.contains(base.wrapping_add(4096)));
        assert!(!a.contains(base.wrapping_sub(1)));
        assert_eq!(a.offset_of(base.wrapping_add(12)), Some(12));
    }

    #[test]
    fn locked_heap_fails_until_initialized() {
        let heap: LockedHeap<ChunkHeap> = LockedHeap::empty();
        let layout = Layout::from_size_align(64, 8).unwrap();
        assert!(unsafe { heap.alloc(layout) }.is_null());
        assert_eq!(heap.stats(), None);

        heap.init(ChunkHeap::new(arena(4)).unwrap());
        let ptrs: Vec<_> = (0..8).map(|_| unsafe { heap.alloc(layout) }).collect();
        assert!(ptrs.iter().all(|p| !p.is_null() && p.addr() % 8 == 0));
        assert_eq!(heap.stats().unwrap().allocations, 8);

        for p in ptrs {
            unsafe { heap.dealloc(p, layout) };
        }
        assert_eq!(heap.stats().unwrap().allocations, 0);
    }

    #[test]
    #[should_panic(expected = "heap initialized twice")]
    fn locked_heap_refuses_a_second_heap() {
        let heap = LockedHeap::new(BumpHeap::new(arena(1)));
        heap.init(BumpHeap::new(arena(1)));
    }

    #[test]
    fn zeroed_allocations_through_the_adapter() {
        let heap = LockedHeap::new(SlabHeap::new(arena(1), 32, 16).unwrap());
        let layout = Layout::from_size_align(32, 16).unwrap();
        let p = unsafe { heap.alloc(layout) };
        unsafe { p.write_bytes(0xAB, 32) };
        unsafe { heap.dealloc(p, layout) };

        let z = unsafe { heap.alloc_zeroed(layout) };
        assert_eq!(z, p);
        assert!(unsafe { core::slice::from_raw_parts(z, 32) }.iter().all(|&b| b == 0));
    }
}
