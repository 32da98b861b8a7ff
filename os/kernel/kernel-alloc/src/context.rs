//! Everything an address space needs from the rest of the kernel.

use crate::pmm::{PhysicalFrame, PhysicalMemoryManager};
use crate::vmm::{Vmm, VmmError};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::layout::MemoryLayout;
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_vmem::page_table::{PageTable, Pml4Entry, TableIndex};
use kernel_vmem::{AtomicCpuMask, CpuId, CpuMask, PageEntry, PageFlags, PhysMapper, TlbShootdown};
use log::{debug, warn};

/// The PMM, the physical-memory mapper, TLB shootdown and the address layout.
///
/// Created once during boot and passed by reference to every [`Vmm`].
///
/// The context also owns the L3 tables of the shared kernel window. Every
/// address space links them from its PML4, so they live exactly as long as
/// the context and outlast any single address space.
pub struct MemoryContext<M: PhysMapper, T: TlbShootdown> {
    pmm: PhysicalMemoryManager,
    mapper: M,
    tlb: T,
    layout: MemoryLayout,
    online: AtomicCpuMask,
    /// One L3 table per window slot, in slot order.
    window: Vec<PhysicalPage<Size4K>>,
    /// A kernel address space exists.
    kernel_taken: AtomicBool,
}

impl<M: PhysMapper, T: TlbShootdown> MemoryContext<M, T> {
    /// Validate `layout` and allocate the shared window tables from `pmm`.
    ///
    /// # Errors
    /// - [`VmmError::Layout`] if `layout` is inconsistent.
    /// - [`VmmError::OutOfMemory`] if the window tables cannot be allocated.
    pub fn new(
        pmm: PhysicalMemoryManager,
        mapper: M,
        tlb: T,
        layout: MemoryLayout,
    ) -> Result<Self, VmmError> {
        layout.validate()?;
        let mut ctx = Self {
            pmm,
            mapper,
            tlb,
            layout,
            online: AtomicCpuMask::new(),
            window: Vec::new(),
            kernel_taken: AtomicBool::new(false),
        };
        for _ in ctx.layout.kernel_window_slots() {
            let Ok(frame) = ctx.pmm.allocate(0) else {
                warn!("out of memory allocating the shared kernel window");
                // Dropping `ctx` returns the tables taken so far.
                return Err(VmmError::OutOfMemory);
            };
            // SAFETY: freshly allocated, so nothing else references it.
            unsafe { ctx.mapper.frame_bytes(frame.page()).fill(0) };
            ctx.window.push(frame.page());
        }
        debug!("shared kernel window: {} L3 tables", ctx.window.len());
        Ok(ctx)
    }

    #[inline]
    #[must_use]
    pub const fn pmm(&self) -> &PhysicalMemoryManager {
        &self.pmm
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn tlb(&self) -> &T {
        &self.tlb
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Record that `cpu` runs kernel code and may cache shared-window translations.
    pub fn cpu_online(&self, cpu: CpuId) {
        self.online.insert(cpu);
    }

    /// Every CPU seen by [`cpu_online`](Self::cpu_online) or an address-space activation.
    #[must_use]
    pub fn online_cpus(&self) -> CpuMask {
        self.online.load()
    }

    /// Create the kernel address space.
    ///
    /// # Errors
    /// As for [`Vmm::new_kernel`].
    pub fn kernel_space(&self) -> Result<Vmm<'_, M, T>, VmmError> {
        Vmm::new_kernel(self)
    }

    /// Create an empty user address space.
    ///
    /// # Errors
    /// As for [`Vmm::new_user`].
    pub fn user_space(&self) -> Result<Vmm<'_, M, T>, VmmError> {
        Vmm::new_user(self)
    }

    /// Point the window slots of `pml4` at the shared L3 tables.
    pub(crate) fn link_window(&self, pml4: &mut PageTable<Pml4Entry>) {
        for (slot, &table) in self.layout.kernel_window_slots().zip(&self.window) {
            pml4.set(
                TableIndex::new(slot as u16),
                Pml4Entry::new_table(table, PageFlags::kernel_rw()),
            );
        }
    }

    /// The shared L3 tables, in slot order.
    pub(crate) fn window_tables(&self) -> &[PhysicalPage<Size4K>] {
        &self.window
    }

    /// Claim the single kernel address space; `false` if it already exists.
    pub(crate) fn claim_kernel(&self) -> bool {
        self.kernel_taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_kernel(&self) {
        self.kernel_taken.store(false, Ordering::Release);
    }
}

impl<M: PhysMapper, T: TlbShootdown> Drop for MemoryContext<M, T> {
    fn drop(&mut self) {
        for page in self.window.drain(..) {
            self.pmm.free(PhysicalFrame::new(page, 0));
        }
    }
}
