//! Host-side stand-ins for physical memory and the TLB.
//!
//! Enabled by the `testing` feature (and always in this crate's unit tests).

use crate::tlb::{CpuId, CpuMask, TlbShootdown};
use crate::{FrameAlloc, PhysMapper};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualPage};
use kernel_sync::SpinLock;

#[repr(C, align(4096))]
struct Frame([u8; 4096]);

/// A zeroed, 4 KiB-aligned host allocation standing in for a range of
/// physical memory starting at `base`.
///
/// Physical address `base + n * 4096` is frame `n` of the arena.
pub struct SimulatedPhysMemory {
    base: PhysicalAddress,
    frames: NonNull<Frame>,
    count: usize,
}

// SAFETY: the arena is plain memory; synchronizing access to it is the job of
// whoever owns the structures placed inside, exactly as for real RAM.
unsafe impl Send for SimulatedPhysMemory {}
unsafe impl Sync for SimulatedPhysMemory {}

impl SimulatedPhysMemory {
    /// # Panics
    /// If `base` is not page aligned or `count` is zero.
    #[must_use]
    pub fn new(base: PhysicalAddress, count: usize) -> Self {
        assert!(base.is_aligned_to(Size4K::SIZE), "unaligned arena base {base:?}");
        assert!(count > 0, "empty arena");
        let arena: Box<[Frame]> = (0..count).map(|_| Frame([0; 4096])).collect();
        let frames = NonNull::from(Box::leak(arena)).cast::<Frame>();
        Self { base, frames, count }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// First physical address past the arena.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + self.count as u64 * Size4K::SIZE)
    }

    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.count
    }

    /// Frame number `n` of the arena.
    #[must_use]
    pub const fn frame(&self, n: usize) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(
            self.base.as_u64() + n as u64 * Size4K::SIZE,
        ))
    }

    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.base.as_u64() && pa.as_u64() < self.end().as_u64()
    }

    /// A simple allocator over frames `first..` of the arena, reusing freed frames.
    #[must_use]
    pub const fn frame_allocator_from(&self, first: usize) -> SimFrameAlloc {
        SimFrameAlloc {
            next: self.frame(first),
            end: self.end(),
            freed: Vec::new(),
            outstanding: 0,
            limit: usize::MAX,
        }
    }

    /// Copy of the bytes of one frame.
    #[must_use]
    pub fn read_frame(&self, page: PhysicalPage<Size4K>) -> Vec<u8> {
        // SAFETY: bounds are checked by `phys_to_ptr`.
        unsafe { self.frame_bytes(page) }.to_vec()
    }

    /// Fill one frame with `byte`.
    pub fn fill_frame(&self, page: PhysicalPage<Size4K>, byte: u8) {
        // SAFETY: bounds are checked by `phys_to_ptr`.
        unsafe { self.frame_bytes(page) }.fill(byte);
    }
}

// SAFETY: every in-range address points into the live, writable arena.
unsafe impl PhysMapper for SimulatedPhysMemory {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!(
            self.contains(pa),
            "{pa:?} outside simulated memory {:?}..{:?}",
            self.base,
            self.end()
        );
        let offset = (pa.as_u64() - self.base.as_u64()) as usize;
        unsafe { self.frames.as_ptr().cast::<u8>().add(offset) }
    }
}

impl Drop for SimulatedPhysMemory {
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.frames.as_ptr(), self.count);
        // SAFETY: created from a leaked `Box<[Frame]>` of exactly this length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// Frame allocator over part of a [`SimulatedPhysMemory`].
#[derive(Debug)]
pub struct SimFrameAlloc {
    next: PhysicalPage<Size4K>,
    end: PhysicalAddress,
    freed: Vec<PhysicalPage<Size4K>>,
    outstanding: usize,
    limit: usize,
}

impl SimFrameAlloc {
    /// Fail every allocation once `limit` frames are outstanding.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Frames handed out and not yet returned.
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl FrameAlloc for SimFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.outstanding >= self.limit {
            return None;
        }
        let page = match self.freed.pop() {
            Some(page) => page,
            None if self.next.base() < self.end => {
                let page = self.next;
                self.next = PhysicalPage::from_number(page.number() + 1);
                page
            }
            None => return None,
        };
        self.outstanding += 1;
        Some(page)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        assert!(!self.freed.contains(&page), "double free of {page:?}");
        self.outstanding -= 1;
        self.freed.push(page);
    }
}

/// A [`TlbShootdown`] that records every request instead of executing it.
#[derive(Debug, Default)]
pub struct RecordingTlb {
    cpu: AtomicU32,
    local: SpinLock<Vec<(CpuId, VirtualPage<Size4K>)>>,
    remote: SpinLock<Vec<(CpuMask, Vec<VirtualPage<Size4K>>)>>,
}

impl RecordingTlb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend subsequent calls run on `cpu`.
    pub fn set_current_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    #[must_use]
    pub fn local_flushes(&self) -> Vec<(CpuId, VirtualPage<Size4K>)> {
        self.local.lock().clone()
    }

    #[must_use]
    pub fn remote_flushes(&self) -> Vec<(CpuMask, Vec<VirtualPage<Size4K>>)> {
        self.remote.lock().clone()
    }

    pub fn clear(&self) {
        self.local.lock().clear();
        self.remote.lock().clear();
    }
}

impl TlbShootdown for RecordingTlb {
    fn current_cpu(&self) -> CpuId {
        self.cpu.load(Ordering::Relaxed)
    }

    fn flush_local(&self, page: VirtualPage<Size4K>) {
        let cpu = self.current_cpu();
        self.local.lock().push((cpu, page));
    }

    fn flush_remote(&self, targets: CpuMask, pages: &[VirtualPage<Size4K>]) {
        self.remote.lock().push((targets, pages.to_vec()));
    }
}
