//! # Address Space Manager
//!
//! A [`Vmm`] is one address space: a PML4 root, the sorted list of
//! [`Mapping`]s it contains, and every page-table frame it allocated.
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌───────────────────────┐
//!                       │ user space            │ private, cloned per process
//! 0x0000_8000_0000_0000 ├───────────────────────┤
//!                       │ (non-canonical hole)  │
//! 0xffff_8000_0000_0000 ├───────────────────────┤ PML4 slot 256
//!                       │ kernel stacks         │ private, cloned per process
//! 0xffff_8080_0000_0000 ├───────────────────────┤ PML4 slots 257..512
//!                       │ shared kernel window  │ same tables in every space
//! 0xffff_ffff_ffff_ffff └───────────────────────┘
//! ```
//!
//! The [`MemoryContext`] holds one L3 table per window slot and every
//! address space links them from its PML4, so kernel mappings added later
//! show up everywhere. There is at most one kernel address space per
//! context. Only it may place mappings inside the window, which makes it the
//! sole owner of every table below the window's L3 tables.
//!
//! One [`SpinLock`] per address space guards its mapping list and page
//! tables. [`map`](Vmm::map) and [`unmap`](Vmm::unmap) are all-or-nothing
//! and finish with local and remote TLB invalidation.

mod clone;
mod user_copy;

use crate::context::MemoryContext;
use crate::heap::HeapArena;
use crate::mapping::{Mapping, MappingError, MappingFlags, Sharing};
use crate::pmm::{PhysicalFrame, PhysicalMemoryManager, PmmError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use kernel_info::layout::LayoutError;
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage,
};
use kernel_sync::SpinLock;
use kernel_vmem::tlb::load_root;
use kernel_vmem::{
    AtomicCpuMask, CpuMask, CreatedTables, FrameAlloc, MapError, PageTableWalker, PhysMapper,
    TlbShootdown, page_table::Pml4Entry,
};
use log::{debug, trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("out of physical memory for page tables")]
    OutOfMemory,
    #[error("{0:?}..{1:?} overlaps an existing mapping")]
    Overlap(VirtualAddress, VirtualAddress),
    #[error("{0:?} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("no free virtual range is large enough")]
    NoVirtualSpace,
    #[error("the range at {0:?} is not allowed in this address space")]
    InvalidRange(VirtualAddress),
    #[error("access to {0:?} violates the mapping's permissions")]
    AccessViolation(VirtualAddress),
    #[error("the mapping at {0:?} is not part of this address space")]
    UnknownMapping(VirtualAddress),
    #[error("the kernel address space already exists")]
    KernelSpaceExists,
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Pmm(#[from] PmmError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// One entry of the mapping list.
struct Region<'c> {
    mapping: Arc<Mapping<'c>>,
    /// Leaves for every page are installed.
    mapped: bool,
}

struct VmmState<'c> {
    /// Sorted by start address, pairwise disjoint.
    regions: Vec<Region<'c>>,
    /// Page-table frames (root excluded) and unbacked leaf copies owned by
    /// this address space.
    internal: Vec<PhysicalPage<Size4K>>,
    /// Next free slot in the kernel stack region.
    next_kernel_stack: VirtualAddress,
}

impl<'c> VmmState<'c> {
    fn find(&self, va: VirtualAddress) -> Option<&Region<'c>> {
        let idx = self.regions.partition_point(|r| r.mapping.start() <= va);
        self.regions[..idx].last().filter(|r| r.mapping.contains(va))
    }

    fn index_of(&self, mapping: &Mapping<'c>) -> Result<usize, VmmError> {
        self.regions
            .binary_search_by_key(&mapping.start(), |r| r.mapping.start())
            .ok()
            .filter(|&i| core::ptr::eq(Arc::as_ptr(&self.regions[i].mapping), mapping))
            .ok_or(VmmError::UnknownMapping(mapping.start()))
    }

    /// Insert keeping the list sorted; returns the new index.
    fn insert(&mut self, region: Region<'c>) -> Result<usize, VmmError> {
        let (start, end) = (region.mapping.start(), region.mapping.end());
        // Sorted and disjoint: only the last mapping starting before `end`
        // can reach past `start`.
        let below_end = self.regions.partition_point(|r| r.mapping.start() < end);
        if let Some(prev) = self.regions[..below_end].last()
            && prev.mapping.end() > start
        {
            warn!(
                "rejecting mapping {start:?}..{end:?}: overlaps {:?}..{:?}",
                prev.mapping.start(),
                prev.mapping.end()
            );
            return Err(VmmError::Overlap(start, end));
        }
        let pos = self.regions.partition_point(|r| r.mapping.start() < start);
        self.regions.insert(pos, region);
        Ok(pos)
    }

    /// Highest `len`-byte gap ending at or below `top` and starting at or
    /// above `floor`, keeping `guard` bytes free below every mapping.
    fn gap_below(&self, floor: u64, top: u64, len: u64, guard: u64) -> Option<u64> {
        let mut end = top;
        for r in self.regions.iter().rev() {
            let (rs, re) = (r.mapping.start().as_u64(), r.mapping.end().as_u64());
            if rs >= end {
                continue;
            }
            let start = end.checked_sub(len).filter(|&s| s >= floor)?;
            if re <= start {
                return Some(start);
            }
            end = rs.saturating_sub(guard);
        }
        end.checked_sub(len).filter(|&s| s >= floor)
    }

    /// Lowest `len`-byte gap starting at or above `floor` and ending at or below `ceiling`.
    fn gap_above(&self, floor: u64, ceiling: u64, len: u64) -> Option<u64> {
        let mut start = floor;
        for r in &self.regions {
            let (rs, re) = (r.mapping.start().as_u64(), r.mapping.end().as_u64());
            if re <= start {
                continue;
            }
            let end = start.checked_add(len).filter(|&e| e <= ceiling)?;
            if end <= rs {
                return Some(start);
            }
            start = re;
        }
        start
            .checked_add(len)
            .filter(|&e| e <= ceiling)
            .map(|_| start)
    }
}

/// Routes the walker's table allocations through the PMM and records them
/// as owned by the address space.
struct TableFrames<'a> {
    pmm: &'a PhysicalMemoryManager,
    owned: &'a mut Vec<PhysicalPage<Size4K>>,
}

impl FrameAlloc for TableFrames<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let page = self.pmm.allocate(0).ok()?.page();
        self.owned.push(page);
        Some(page)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        if let Some(i) = self.owned.iter().rposition(|&p| p == page) {
            self.owned.swap_remove(i);
        }
        self.pmm.free(PhysicalFrame::new(page, 0));
    }
}

/// One address space.
pub struct Vmm<'c, M: PhysMapper, T: TlbShootdown> {
    ctx: &'c MemoryContext<M, T>,
    root: PhysicalPage<Size4K>,
    kernel: bool,
    state: SpinLock<VmmState<'c>>,
    /// CPUs that currently have `root` loaded.
    active: AtomicCpuMask,
}

impl<'c, M: PhysMapper, T: TlbShootdown> Vmm<'c, M, T> {
    fn with_root(ctx: &'c MemoryContext<M, T>, kernel: bool) -> Result<Self, VmmError> {
        let root = Self::zeroed_frame(ctx)?;
        Ok(Self {
            ctx,
            root,
            kernel,
            state: SpinLock::new(VmmState {
                regions: Vec::new(),
                internal: Vec::new(),
                next_kernel_stack: VirtualAddress::new(ctx.layout().kernel_stacks.start),
            }),
            active: AtomicCpuMask::new(),
        })
    }

    fn zeroed_frame(ctx: &MemoryContext<M, T>) -> Result<PhysicalPage<Size4K>, VmmError> {
        let Ok(frame) = ctx.pmm().allocate(0) else {
            warn!("out of memory allocating a page-table frame");
            return Err(VmmError::OutOfMemory);
        };
        // SAFETY: freshly allocated, so nothing else references it.
        unsafe { ctx.mapper().frame_bytes(frame.page()).fill(0) };
        Ok(frame.page())
    }

    /// Create the kernel address space, the only one allowed to map into the
    /// shared window.
    ///
    /// Dropping it unmaps everything it placed in the window, in every
    /// address space; a new one may be created afterwards.
    ///
    /// # Errors
    /// - [`VmmError::KernelSpaceExists`] while another kernel address space
    ///   of `ctx` is alive.
    /// - [`VmmError::OutOfMemory`] if the root cannot be allocated.
    pub fn new_kernel(ctx: &'c MemoryContext<M, T>) -> Result<Self, VmmError> {
        if !ctx.claim_kernel() {
            warn!("refusing a second kernel address space");
            return Err(VmmError::KernelSpaceExists);
        }
        let vmm = match Self::with_root(ctx, true) {
            Ok(vmm) => vmm,
            Err(e) => {
                ctx.release_kernel();
                return Err(e);
            }
        };
        // SAFETY: the root was just allocated and is not shared yet.
        ctx.link_window(unsafe { ctx.mapper().table_mut::<Pml4Entry>(vmm.root) });
        debug!("created kernel address space {}", vmm.root);
        Ok(vmm)
    }

    /// Create an empty user address space that shares the kernel window.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if the root cannot be allocated.
    pub fn new_user(ctx: &'c MemoryContext<M, T>) -> Result<Self, VmmError> {
        let vmm = Self::with_root(ctx, false)?;
        // SAFETY: the new root is private.
        ctx.link_window(unsafe { ctx.mapper().table_mut::<Pml4Entry>(vmm.root) });
        debug!("created user address space {}", vmm.root);
        Ok(vmm)
    }

    /// Physical frame of the PML4.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.kernel
    }

    #[inline]
    #[must_use]
    pub const fn context(&self) -> &'c MemoryContext<M, T> {
        self.ctx
    }

    /// A walker over this address space's tree.
    ///
    /// Borrowing the locked state proves the caller serializes access.
    fn walker(&self, _locked: &VmmState<'c>) -> PageTableWalker<'c, M> {
        // SAFETY: the root and all tables below it are reachable through the
        // context's mapper; the caller holds the state lock.
        unsafe { PageTableWalker::new(self.root, self.ctx.mapper()) }
    }

    /// Check that `mapping` may live in this address space.
    ///
    /// User-accessible mappings must stay below the end of user space.
    fn check_range(&self, mapping: &Mapping<'c>) -> Result<(), VmmError> {
        let layout = self.ctx.layout();
        let (s, e) = (mapping.start().as_u64(), mapping.end().as_u64());
        let user = e <= layout.user_end;
        let stacks = s >= layout.kernel_stacks.start && e <= layout.kernel_stacks.end;
        let window = self.kernel && s >= layout.kernel_window_start;
        if user || (!mapping.flags().user() && (stacks || window)) {
            Ok(())
        } else {
            warn!("rejecting {mapping:?} in {}", self.root);
            Err(VmmError::InvalidRange(mapping.start()))
        }
    }

    /// The mapping containing `va`, if any.
    #[must_use]
    pub fn find_vmapping(&self, va: VirtualAddress) -> Option<Arc<Mapping<'c>>> {
        self.state
            .lock()
            .find(va)
            .map(|r| Arc::clone(&r.mapping))
    }

    /// Add `mapping` to the list without touching page tables.
    ///
    /// # Errors
    /// - [`VmmError::InvalidRange`] if the range is not allowed here (e.g.
    ///   the shared window in a user address space).
    /// - [`VmmError::Overlap`] if it intersects an existing mapping.
    pub fn insert_vmapping(&self, mapping: Arc<Mapping<'c>>) -> Result<(), VmmError> {
        self.check_range(&mapping)?;
        self.state.lock().insert(Region {
            mapping,
            mapped: false,
        })?;
        Ok(())
    }

    /// Unmap (if mapped) and forget the mapping starting at `start`.
    ///
    /// The mapping's frames return to the PMM once no other reference remains.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] if no mapping starts at `start`.
    pub fn remove_vmapping(&self, start: VirtualAddress) -> Result<(), VmmError> {
        let mut state = self.state.lock();
        let idx = state
            .regions
            .binary_search_by_key(&start, |r| r.mapping.start())
            .map_err(|_| VmmError::NotMapped(start))?;
        if state.regions[idx].mapped {
            let mapping = Arc::clone(&state.regions[idx].mapping);
            self.uninstall(&state, &mapping)?;
        }
        let region = state.regions.remove(idx);
        debug!("removed {:?} from {}", region.mapping, self.root);
        Ok(())
    }

    /// Install leaves for every page of `mapping`, which must be in the list.
    ///
    /// Missing tables are created. On failure everything this call installed
    /// or created is undone.
    ///
    /// # Errors
    /// - [`VmmError::UnknownMapping`] if `mapping` was not inserted here.
    /// - [`VmmError::Map`] if a page is already mapped, a huge page is in the
    ///   way, or a table frame cannot be allocated.
    pub fn map(&self, mapping: &Mapping<'c>) -> Result<(), VmmError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let idx = state.index_of(mapping)?;
        if state.regions[idx].mapped {
            return Err(MapError::AlreadyMapped(mapping.start()).into());
        }
        self.install(state, mapping)?;
        state.regions[idx].mapped = true;
        Ok(())
    }

    /// Clear the leaves of `mapping`. Page tables stay in place.
    ///
    /// # Errors
    /// - [`VmmError::UnknownMapping`] if `mapping` was not inserted here.
    /// - [`VmmError::NotMapped`] if it is not currently mapped.
    pub fn unmap(&self, mapping: &Mapping<'c>) -> Result<(), VmmError> {
        let mut guard = self.state.lock();
        let idx = guard.index_of(mapping)?;
        if !guard.regions[idx].mapped {
            return Err(VmmError::NotMapped(mapping.start()));
        }
        self.uninstall(&guard, mapping)?;
        guard.regions[idx].mapped = false;
        Ok(())
    }

    fn install(&self, state: &mut VmmState<'c>, mapping: &Mapping<'c>) -> Result<(), VmmError> {
        let walker = self.walker(state);
        let flags = mapping.flags().page_flags();
        let mut frames = TableFrames {
            pmm: self.ctx.pmm(),
            owned: &mut state.internal,
        };

        let mut done: Vec<(VirtualPage<Size4K>, CreatedTables)> =
            Vec::with_capacity(mapping.page_count());
        for (page, frame) in mapping.pages() {
            match walker.map_4k(page, frame, flags, &mut frames) {
                Ok(created) => done.push((page, created)),
                Err(e) => {
                    warn!(
                        "mapping {mapping:?} failed at {page:?}: {e}; rolling back {} pages",
                        done.len()
                    );
                    for &(page, created) in done.iter().rev() {
                        if let Err(e) = walker.unmap_4k(page) {
                            panic!("rollback of {page:?} in {}: {e}", self.root);
                        }
                        walker.release(page, created, &mut frames);
                    }
                    let pages: Vec<_> = done.iter().map(|&(p, _)| p).collect();
                    self.shootdown(&pages);
                    return Err(e.into());
                }
            }
        }

        let pages: Vec<_> = done.into_iter().map(|(p, _)| p).collect();
        trace!("mapped {} pages at {:?} in {}", pages.len(), mapping.start(), self.root);
        self.shootdown(&pages);
        Ok(())
    }

    fn uninstall(&self, state: &VmmState<'c>, mapping: &Mapping<'c>) -> Result<(), VmmError> {
        // The window's leaves belong to the kernel address space alone.
        if !self.kernel && self.ctx.layout().in_kernel_window(mapping.start()) {
            return Err(VmmError::InvalidRange(mapping.start()));
        }
        let walker = self.walker(state);

        // Check every page first so a failure leaves the tree untouched.
        for (page, frame) in mapping.pages() {
            match walker.translate(page.base()) {
                Some((pa, _)) if pa == frame.base() => {}
                _ => return Err(VmmError::NotMapped(page.base())),
            }
        }

        let mut pages = Vec::with_capacity(mapping.page_count());
        for (page, _) in mapping.pages() {
            if let Err(e) = walker.unmap_4k(page) {
                panic!("{page:?} translated but cannot be unmapped: {e}");
            }
            pages.push(page);
        }
        trace!("unmapped {} pages at {:?} in {}", pages.len(), mapping.start(), self.root);
        self.shootdown(&pages);
        Ok(())
    }

    /// Invalidate `pages` locally and on every other CPU that may cache them.
    fn shootdown(&self, pages: &[VirtualPage<Size4K>]) {
        if pages.is_empty() {
            return;
        }
        let tlb = self.ctx.tlb();
        for &page in pages {
            tlb.flush_local(page);
        }

        let layout = self.ctx.layout();
        let shared = self.kernel && pages.iter().any(|p| layout.in_kernel_window(p.base()));
        let candidates = if shared {
            self.ctx.online_cpus()
        } else {
            self.active.load()
        };
        let targets = candidates.without(tlb.current_cpu());
        if !targets.is_empty() {
            trace!("remote TLB shootdown of {} pages on {targets:?}", pages.len());
            tlb.flush_remote(targets, pages);
        }
    }

    /// Create, insert and map a mapping at `start` while holding the lock.
    fn place(
        &self,
        state: &mut VmmState<'c>,
        start: u64,
        size: u64,
        flags: MappingFlags,
        sharing: Sharing,
    ) -> Result<Arc<Mapping<'c>>, VmmError> {
        let start = VirtualAddress::new(start);
        let mapping = Arc::new(Mapping::create(self.ctx.pmm(), start, size, flags, sharing)?);
        self.check_range(&mapping)?;
        for frame in mapping.frames() {
            // SAFETY: the frames are freshly allocated and not yet mapped
            // anywhere, so nothing else can observe them.
            unsafe { self.ctx.mapper().phys_to_slice(frame.base(), frame.size() as usize) }.fill(0);
        }
        let idx = state.insert(Region {
            mapping: Arc::clone(&mapping),
            mapped: false,
        })?;
        if let Err(e) = self.install(state, &mapping) {
            state.regions.remove(idx);
            return Err(e);
        }
        state.regions[idx].mapped = true;
        Ok(mapping)
    }

    /// Map a user stack of `size` bytes (rounded up to pages) below the
    /// highest free range under the user stack top, with an unmapped guard
    /// page beneath it.
    ///
    /// # Errors
    /// [`VmmError::NoVirtualSpace`] if no gap is large enough, or any error
    /// of creating and mapping the stack.
    pub fn allocate_user_stack(&self, size: u64) -> Result<Arc<Mapping<'c>>, VmmError> {
        let layout = self.ctx.layout();
        let size = page_align(size)?;
        let with_guard = size.checked_add(Size4K::SIZE).ok_or(VmmError::NoVirtualSpace)?;
        let mut state = self.state.lock();
        let gap = state
            .gap_below(layout.user_heap_base, layout.user_stack_top, with_guard, Size4K::SIZE)
            .ok_or(VmmError::NoVirtualSpace)?;
        let stack = self.place(&mut state, gap + Size4K::SIZE, size, MappingFlags::user_rw(), Sharing::Private)?;
        debug!("user stack {:?}..{:?} in {}", stack.start(), stack.end(), self.root);
        Ok(stack)
    }

    /// Map the next kernel stack from the kernel stack region.
    ///
    /// Stacks are [`kernel_stack_size`](kernel_info::layout::MemoryLayout::kernel_stack_size)
    /// bytes, each preceded by an unmapped guard gap.
    ///
    /// # Errors
    /// [`VmmError::NoVirtualSpace`] once the region is exhausted, or any error
    /// of creating and mapping the stack.
    pub fn allocate_kernel_stack(&self) -> Result<Arc<Mapping<'c>>, VmmError> {
        let layout = self.ctx.layout();
        let mut state = self.state.lock();
        let start = state.next_kernel_stack.as_u64() + layout.kernel_stack_guard;
        let end = start + layout.kernel_stack_size;
        if end > layout.kernel_stacks.end {
            warn!("kernel stack region of {} exhausted", self.root);
            return Err(VmmError::NoVirtualSpace);
        }
        let stack = self.place(&mut state, start, layout.kernel_stack_size, MappingFlags::kernel_rw(), Sharing::Private)?;
        state.next_kernel_stack = VirtualAddress::new(end);
        debug!("kernel stack {:?}..{:?} in {}", stack.start(), stack.end(), self.root);
        Ok(stack)
    }

    /// Map `size` bytes (rounded up to pages) at the lowest free address at
    /// or above the user heap base.
    ///
    /// # Errors
    /// [`VmmError::NoVirtualSpace`] if no gap is large enough below the user
    /// stack area, or any error of creating and mapping the range.
    pub fn allocate_user_heap(&self, size: u64) -> Result<Arc<Mapping<'c>>, VmmError> {
        let layout = self.ctx.layout();
        let size = page_align(size)?;
        let ceiling = layout.user_stack_top - layout.user_stack_size;
        let mut state = self.state.lock();
        let start = state
            .gap_above(layout.user_heap_base, ceiling, size)
            .ok_or(VmmError::NoVirtualSpace)?;
        let heap = self.place(&mut state, start, size, MappingFlags::user_rw(), Sharing::Private)?;
        debug!("user heap {:?}..{:?} in {}", heap.start(), heap.end(), self.root);
        Ok(heap)
    }

    /// Map `size` bytes in the kernel heap region and hand them out as an arena
    /// for a heap allocator.
    ///
    /// The mapping stays in the kernel address space for good.
    ///
    /// # Errors
    /// - [`VmmError::InvalidRange`] on a user address space.
    /// - [`VmmError::NoVirtualSpace`] if the heap region has no gap of `size`.
    /// - Any error of creating and mapping the range.
    pub fn allocate_kernel_heap(&self, size: u64) -> Result<HeapArena, VmmError> {
        let layout = self.ctx.layout();
        if !self.kernel {
            return Err(VmmError::InvalidRange(VirtualAddress::new(layout.kernel_heap.start)));
        }
        let size = page_align(size)?;
        let mut state = self.state.lock();
        let start = state
            .gap_above(layout.kernel_heap.start, layout.kernel_heap.end, size)
            .ok_or(VmmError::NoVirtualSpace)?;
        let heap = self.place(&mut state, start, size, MappingFlags::kernel_rw(), Sharing::Shared)?;
        debug!("kernel heap arena {:?}..{:?}", heap.start(), heap.end());

        let base = NonNull::new(heap.start().as_mut_ptr::<u8>()).ok_or(VmmError::NoVirtualSpace)?;
        // SAFETY: the range is mapped read/write in the shared window for as
        // long as the kernel address space lives, and nothing else uses it.
        Ok(unsafe { HeapArena::from_raw_parts(base, size as usize) })
    }

    /// Physical address `va` translates to in this address space.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let state = self.state.lock();
        self.walker(&state).translate(va).map(|(pa, _)| pa)
    }

    /// Number of mappings in the list.
    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Page-table frames owned by this address space, root included.
    #[must_use]
    pub fn table_frames(&self) -> usize {
        self.state.lock().internal.len() + 1
    }

    /// Load this address space on the current CPU.
    ///
    /// The caller must [`deactivate`](Self::deactivate) the previously
    /// active address space on this CPU.
    ///
    /// # Safety
    /// The shared window must map the code and stack currently executing.
    pub unsafe fn activate(&self) {
        let cpu = self.ctx.tlb().current_cpu();
        self.active.insert(cpu);
        self.ctx.cpu_online(cpu);
        // SAFETY: forwarded from the caller.
        unsafe { load_root(self.root) };
        trace!("cpu {cpu} switched to {}", self.root);
    }

    /// Record that the current CPU no longer runs on this address space.
    pub fn deactivate(&self) {
        self.active.remove(self.ctx.tlb().current_cpu());
    }

    /// CPUs that currently have this address space loaded.
    #[must_use]
    pub fn active_cpus(&self) -> CpuMask {
        self.active.load()
    }
}

/// `size` rounded up to whole pages.
fn page_align(size: u64) -> Result<u64, VmmError> {
    size.checked_next_multiple_of(Size4K::SIZE)
        .ok_or(VmmError::NoVirtualSpace)
}

impl<M: PhysMapper, T: TlbShootdown> Drop for Vmm<'_, M, T> {
    fn drop(&mut self) {
        let active = self.active.load();
        if !active.is_empty() {
            warn!("tearing down {} while active on {active:?}", self.root);
        }
        if self.kernel {
            self.detach_window();
        }
        let pmm = self.ctx.pmm();
        let state = self.state.get_mut();
        let mappings = state.regions.len();
        state.regions.clear();
        let tables = state.internal.len();
        for page in state.internal.drain(..) {
            pmm.free(PhysicalFrame::new(page, 0));
        }
        pmm.free(PhysicalFrame::new(self.root, 0));
        debug!(
            "tore down address space {}: {mappings} mappings, {} frames",
            self.root,
            tables + 1
        );
    }
}

impl<M: PhysMapper, T: TlbShootdown> Vmm<'_, M, T> {
    /// Empty the shared window's L3 tables so no address space reaches the
    /// tables and frames this kernel address space is about to free.
    fn detach_window(&mut self) {
        let layout = self.ctx.layout();
        let pages: Vec<_> = self
            .state
            .get_mut()
            .regions
            .iter()
            .filter(|r| r.mapped && layout.in_kernel_window(r.mapping.start()))
            .flat_map(|r| r.mapping.pages().map(|(page, _)| page))
            .collect();
        for &table in self.ctx.window_tables() {
            // SAFETY: only the kernel address space writes below the window,
            // and it is being dropped, so nothing else walks these entries.
            unsafe { self.ctx.mapper().frame_bytes(table).fill(0) };
        }
        self.shootdown(&pages);
        self.ctx.release_kernel();
        debug!("detached {} window pages of {}", pages.len(), self.root);
    }
}

impl<M: PhysMapper, T: TlbShootdown> fmt::Debug for Vmm<'_, M, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vmm")
            .field("root", &self.root)
            .field("kernel", &self.kernel)
            .field("active", &self.active.load())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pmm::FrameBitmap;
    use alloc::boxed::Box;
    use alloc::vec;
    use kernel_info::layout::MemoryLayout;
    use kernel_vmem::testing::{RecordingTlb, SimulatedPhysMemory};

    /// A PMM over simulated memory and a layout whose shared window is the
    /// last PML4 slot, so a kernel address space needs only one window table.
    pub(crate) struct Fixture {
        pub(crate) ctx: MemoryContext<SimulatedPhysMemory, RecordingTlb>,
    }

    impl Fixture {
        pub(crate) fn new(frames: usize) -> Self {
            let mem = SimulatedPhysMemory::new(PhysicalAddress::new(0x10_0000), frames);
            let pmm = PhysicalMemoryManager::new();
            let bits = Box::leak(vec![0u8; FrameBitmap::storage_bytes(frames)].into_boxed_slice());
            pmm.add_region(mem.base(), frames, bits).unwrap();
            let layout = MemoryLayout {
                kernel_window_start: 0xffff_ff80_0000_0000,
                kernel_heap: 0xffff_ff80_0000_0000..0xffff_ff80_4000_0000,
                ..MemoryLayout::DEFAULT
            };
            let ctx = MemoryContext::new(pmm, mem, RecordingTlb::new(), layout).unwrap();
            Self { ctx }
        }

        pub(crate) fn mem(&self) -> &SimulatedPhysMemory {
            self.ctx.mapper()
        }
    }

    pub(crate) fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn user_mapping<'c>(fx: &'c Fixture, start: u64, size: u64) -> Arc<Mapping<'c>> {
        Arc::new(
            Mapping::create(fx.ctx.pmm(), va(start), size, MappingFlags::user_rw(), Sharing::Private)
                .unwrap(),
        )
    }

    #[test]
    fn overlapping_mappings_are_rejected() {
        let fx = Fixture::new(64);
        let user = fx.ctx.user_space().unwrap();

        user.insert_vmapping(user_mapping(&fx, 0x1000, 0x2000)).unwrap();
        assert_eq!(
            user.insert_vmapping(user_mapping(&fx, 0x2000, 0x2000)),
            Err(VmmError::Overlap(va(0x2000), va(0x4000)))
        );
        // Touching the end of an existing mapping is fine.
        user.insert_vmapping(user_mapping(&fx, 0x3000, 0x1000)).unwrap();
        assert_eq!(user.mapping_count(), 2);
    }

    #[test]
    fn find_returns_the_single_containing_mapping() {
        let fx = Fixture::new(64);
        let user = fx.ctx.user_space().unwrap();
        let a = user_mapping(&fx, 0x1000, 0x2000);
        let c = user_mapping(&fx, 0x3000, 0x1000);
        user.insert_vmapping(Arc::clone(&c)).unwrap();
        user.insert_vmapping(Arc::clone(&a)).unwrap();

        assert!(Arc::ptr_eq(&user.find_vmapping(va(0x1000)).unwrap(), &a));
        assert!(Arc::ptr_eq(&user.find_vmapping(va(0x2FFF)).unwrap(), &a));
        assert!(Arc::ptr_eq(&user.find_vmapping(va(0x3000)).unwrap(), &c));
        assert!(user.find_vmapping(va(0x4000)).is_none());
        assert!(user.find_vmapping(va(0x0FFF)).is_none());
    }

    #[test]
    fn only_the_kernel_space_may_use_the_window() {
        let fx = Fixture::new(64);
        let kernel = fx.ctx.kernel_space().unwrap();
        let user = fx.ctx.user_space().unwrap();
        let start = fx.ctx.layout().kernel_heap.start;
        let window = Arc::new(
            Mapping::create(fx.ctx.pmm(), va(start), 0x1000, MappingFlags::kernel_rw(), Sharing::Shared)
                .unwrap(),
        );

        assert_eq!(
            user.insert_vmapping(Arc::clone(&window)),
            Err(VmmError::InvalidRange(va(start)))
        );
        kernel.insert_vmapping(Arc::clone(&window)).unwrap();
        kernel.map(&window).unwrap();

        // Visible through the user space's copy of the window entries.
        assert_eq!(user.translate(va(start)), Some(window.frames()[0].base()));
    }

    #[test]
    fn map_and_unmap_update_translations() {
        let fx = Fixture::new(64);
        let user = fx.ctx.user_space().unwrap();
        let m = user_mapping(&fx, 0x40_0000, 0x3000);

        assert_eq!(user.map(&m), Err(VmmError::UnknownMapping(m.start())));
        user.insert_vmapping(Arc::clone(&m)).unwrap();
        assert_eq!(user.translate(m.start()), None);

        user.map(&m).unwrap();
        for (page, frame) in m.pages() {
            assert_eq!(user.translate(page.base() + 0x42), Some(frame.base() + 0x42));
        }
        assert_eq!(
            user.map(&m),
            Err(VmmError::Map(MapError::AlreadyMapped(m.start())))
        );

        user.unmap(&m).unwrap();
        assert_eq!(user.translate(m.start()), None);
        assert_eq!(user.unmap(&m), Err(VmmError::NotMapped(m.start())));

        // Mapping again reuses the tables left in place.
        let tables = user.table_frames();
        user.map(&m).unwrap();
        assert_eq!(user.table_frames(), tables);
    }

    #[test]
    fn failed_map_rolls_back_tables_and_leaves() {
        let fx = Fixture::new(64);
        let user = fx.ctx.user_space().unwrap();
        // Straddles a 2 MiB boundary, so the last two pages need a second PT.
        let m = user_mapping(&fx, 0x1F_E000, 0x4000);
        user.insert_vmapping(Arc::clone(&m)).unwrap();

        // Exactly enough for the PDPT, PD and first PT.
        let mut hog = Vec::new();
        while fx.ctx.pmm().free_frames() > 3 {
            hog.push(fx.ctx.pmm().allocate(0).unwrap());
        }
        let tables = user.table_frames();

        let err = user.map(&m).unwrap_err();
        assert!(matches!(err, VmmError::Map(MapError::OutOfMemory(_))), "{err:?}");
        assert_eq!(fx.ctx.pmm().free_frames(), 3);
        assert_eq!(user.table_frames(), tables);
        for (page, _) in m.pages() {
            assert_eq!(user.translate(page.base()), None);
        }

        for frame in hog {
            fx.ctx.pmm().free(frame);
        }
        user.map(&m).unwrap();
        assert!(user.translate(va(0x20_1000)).is_some());
    }

    #[test]
    fn remote_cpus_are_shot_down_only_where_needed() {
        let fx = Fixture::new(128);
        let tlb = fx.ctx.tlb();
        let kernel = fx.ctx.kernel_space().unwrap();
        let user = fx.ctx.user_space().unwrap();

        tlb.set_current_cpu(1);
        // SAFETY: activation only records the CPU on the host.
        unsafe { user.activate() };
        tlb.set_current_cpu(0);
        fx.ctx.cpu_online(2);

        let m = user_mapping(&fx, 0x10_0000, 0x2000);
        user.insert_vmapping(Arc::clone(&m)).unwrap();
        user.map(&m).unwrap();
        assert_eq!(
            tlb.local_flushes(),
            [(0, m.start().page()), (0, (m.start() + 0x1000).page())]
        );
        let remote = tlb.remote_flushes();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].0, CpuMask::single(1));
        assert_eq!(remote[0].1.len(), 2);

        // Shared window pages go to every online CPU but the current one.
        tlb.clear();
        kernel.allocate_kernel_heap(0x1000).unwrap();
        let remote = tlb.remote_flushes();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].0, CpuMask::single(1).with(2));

        // Nothing remote once the other CPU left.
        tlb.clear();
        tlb.set_current_cpu(1);
        user.deactivate();
        tlb.set_current_cpu(0);
        user.unmap(&m).unwrap();
        assert!(tlb.remote_flushes().is_empty());
        assert_eq!(tlb.local_flushes().len(), 2);
    }

    #[test]
    fn stacks_are_separated_by_guard_pages() {
        let fx = Fixture::new(256);
        let layout = fx.ctx.layout().clone();
        let user = fx.ctx.user_space().unwrap();

        let first = user.allocate_user_stack(0x3800).unwrap();
        assert_eq!(first.end(), va(layout.user_stack_top));
        assert_eq!(first.size(), 0x4000);
        let second = user.allocate_user_stack(0x2000).unwrap();
        assert_eq!(second.end() + Size4K::SIZE, first.start());
        assert_eq!(user.translate(va(first.start().as_u64() - 1)), None);

        let k1 = user.allocate_kernel_stack().unwrap();
        let k2 = user.allocate_kernel_stack().unwrap();
        assert_eq!(k1.start(), va(layout.kernel_stacks.start + layout.kernel_stack_guard));
        assert_eq!(k1.size(), layout.kernel_stack_size);
        assert_eq!(k2.start(), k1.end() + layout.kernel_stack_guard);
        assert_eq!(user.translate(k1.end()), None);
        assert!(!k1.flags().user());
    }

    #[test]
    fn user_heap_takes_the_lowest_gap() {
        let fx = Fixture::new(128);
        let base = fx.ctx.layout().user_heap_base;
        let user = fx.ctx.user_space().unwrap();

        let h1 = user.allocate_user_heap(0x1800).unwrap();
        assert_eq!((h1.start(), h1.size()), (va(base), 0x2000));
        let h2 = user.allocate_user_heap(0x1000).unwrap();
        assert_eq!(h2.start(), h1.end());

        let freed = h1.start();
        drop(h1);
        user.remove_vmapping(freed).unwrap();
        let h3 = user.allocate_user_heap(0x1000).unwrap();
        assert_eq!(h3.start(), va(base));
        assert_eq!(
            user.allocate_user_heap(0x8000_0000_0000).unwrap_err(),
            VmmError::NoVirtualSpace
        );
    }

    #[test]
    fn kernel_heap_is_kernel_only() {
        let fx = Fixture::new(128);
        let heap = fx.ctx.layout().kernel_heap.clone();
        let kernel = fx.ctx.kernel_space().unwrap();
        let user = fx.ctx.user_space().unwrap();

        assert_eq!(
            user.allocate_kernel_heap(0x1000).unwrap_err(),
            VmmError::InvalidRange(va(heap.start))
        );
        let arena = kernel.allocate_kernel_heap(0x2001).unwrap();
        assert_eq!(arena.len(), 0x3000);
        assert_eq!(VirtualAddress::from_nonnull(arena.base()), va(heap.start));
        let next = kernel.allocate_kernel_heap(0x1000).unwrap();
        assert_eq!(VirtualAddress::from_nonnull(next.base()), va(heap.start + 0x3000));
    }

    #[test]
    fn removing_a_mapping_returns_its_frames() {
        let fx = Fixture::new(128);
        let user = fx.ctx.user_space().unwrap();
        let free = fx.ctx.pmm().free_frames();
        let tables = user.table_frames();

        let start = user.allocate_user_heap(0x4000).unwrap().start();
        assert_eq!(fx.ctx.pmm().free_frames(), free - 4 - (user.table_frames() - tables));
        user.remove_vmapping(start).unwrap();
        assert_eq!(user.translate(start), None);
        // Only the page tables remain.
        assert_eq!(fx.ctx.pmm().free_frames(), free - (user.table_frames() - tables));
        assert_eq!(user.remove_vmapping(start), Err(VmmError::NotMapped(start)));
    }

    #[test]
    fn teardown_returns_every_frame() {
        let fx = Fixture::new(512);
        let free = fx.ctx.pmm().free_frames();
        {
            let kernel = fx.ctx.kernel_space().unwrap();
            kernel.allocate_kernel_heap(0x4000).unwrap();
            let user = fx.ctx.user_space().unwrap();
            user.allocate_user_stack(0x4000).unwrap();
            user.allocate_kernel_stack().unwrap();
            user.allocate_user_heap(0x2000).unwrap();
            let child = user.try_clone().unwrap();
            child.allocate_user_heap(0x1000).unwrap();
            assert!(fx.ctx.pmm().free_frames() < free);
            drop(child);
            drop(user);
        }
        assert_eq!(fx.ctx.pmm().free_frames(), free);
        assert_eq!(fx.ctx.pmm().audit(), fx.ctx.pmm().allocated_frames());
    }

    #[test]
    fn oversized_requests_fail_instead_of_overflowing() {
        let fx = Fixture::new(64);
        let kernel = fx.ctx.kernel_space().unwrap();
        let user = fx.ctx.user_space().unwrap();
        let free = fx.ctx.pmm().free_frames();

        for size in [u64::MAX, u64::MAX - 0xFFF] {
            assert_eq!(user.allocate_user_stack(size).unwrap_err(), VmmError::NoVirtualSpace);
            assert_eq!(user.allocate_user_heap(size).unwrap_err(), VmmError::NoVirtualSpace);
            assert_eq!(kernel.allocate_kernel_heap(size).unwrap_err(), VmmError::NoVirtualSpace);
        }
        assert_eq!(fx.ctx.pmm().free_frames(), free);
        assert_eq!(user.mapping_count(), 0);
    }

    #[test]
    fn user_mappings_stay_below_the_end_of_user_space() {
        let fx = Fixture::new(64);
        let user = fx.ctx.user_space().unwrap();
        let stacks = fx.ctx.layout().kernel_stacks.start;

        let exposed = user_mapping(&fx, stacks, 0x1000);
        assert_eq!(
            user.insert_vmapping(exposed),
            Err(VmmError::InvalidRange(va(stacks)))
        );
        let private = Arc::new(
            Mapping::create(fx.ctx.pmm(), va(stacks), 0x1000, MappingFlags::kernel_rw(), Sharing::Private)
                .unwrap(),
        );
        user.insert_vmapping(Arc::clone(&private)).unwrap();
        user.map(&private).unwrap();

        // The kernel-stack slot never becomes user accessible.
        let state = user.state.lock();
        let (_, flags) = user.walker(&state).translate(va(stacks)).unwrap();
        assert!(!flags.user());
    }

    #[test]
    fn one_kernel_space_per_context() {
        let fx = Fixture::new(64);
        let kernel = fx.ctx.kernel_space().unwrap();
        assert_eq!(fx.ctx.kernel_space().unwrap_err(), VmmError::KernelSpaceExists);
        assert_eq!(
            Vmm::new_kernel(&fx.ctx).unwrap_err(),
            VmmError::KernelSpaceExists
        );
        drop(kernel);
        assert!(fx.ctx.kernel_space().unwrap().is_kernel());
    }

    #[test]
    fn user_spaces_cannot_unmap_window_pages() {
        let fx = Fixture::new(64);
        let kernel = fx.ctx.kernel_space().unwrap();
        let user = fx.ctx.user_space().unwrap();
        let arena = kernel.allocate_kernel_heap(0x1000).unwrap();
        let heap = kernel.find_vmapping(VirtualAddress::from_nonnull(arena.base())).unwrap();

        // Smuggle the window mapping into the user list behind the checks.
        user.state.lock().regions.push(Region {
            mapping: Arc::clone(&heap),
            mapped: true,
        });
        assert_eq!(user.unmap(&heap), Err(VmmError::InvalidRange(heap.start())));
        assert_eq!(
            user.remove_vmapping(heap.start()),
            Err(VmmError::InvalidRange(heap.start()))
        );
        assert_eq!(kernel.translate(heap.start()), Some(heap.frames()[0].base()));
        user.state.lock().regions.clear();
    }
}
