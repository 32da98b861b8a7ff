//! # Virtual Memory Support
//!
//! x86-64 4-level paging for the kernel's memory manager.
//!
//! ## What you get
//! - The [`page_table`] data layer: one entry codec per level, 512-entry
//!   tables and virtual-address decomposition.
//! - A [`PageTableWalker`] that creates intermediate tables on demand and
//!   installs or clears 4 KiB leaves.
//! - The seams to the rest of the kernel: [`FrameAlloc`] (where table frames
//!   come from), [`PhysMapper`] (how a physical frame is reached from the
//!   current address space) and [`TlbShootdown`](tlb::TlbShootdown).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes (64 bits) each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   (Page Table Entry)  → maps 4 KiB page
//!   │        │        └────────────► PDE   (Page Directory Entry) → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE (Page Directory Pointer Table Entry) → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E (Page Map Level 4 Entry)
//! ```
//!
//! The walker only ever *creates* 4 KiB leaves. Huge leaves found in an
//! existing tree are honored by [`PageTableWalker::translate`] and reported as
//! [`MapError::HugePageInTheWay`] by the mutating operations.
//!
//! ## Testing
//!
//! With the `testing` feature, [`testing`] provides a host-backed physical
//! memory arena and a TLB that records invalidations.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

mod hhdm;
pub mod page_table;
pub mod tlb;
mod walker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::hhdm::HhdmMapper;
pub use crate::page_table::{
    EntryFlag, EntryKind, PageEntry, PageFlags, PageLevel, PageTable, Pml4Table,
};
pub use crate::tlb::{AtomicCpuMask, CpuId, CpuMask, TlbShootdown};
pub use crate::walker::{CreatedTables, MapError, PageTableWalker};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};

/// Source of **physical** 4 KiB frames for page tables.
///
/// The implementation decides where frames come from (bitmap allocator,
/// boot pool, test arena). Returned frames are page aligned and their
/// contents are unspecified; the walker zeroes every table it creates.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame, or `None` when out of memory.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame previously obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (e.g., via a higher-half direct map).
///
/// # Safety
/// Implementations must return a pointer through which the whole frame
/// containing `pa` is readable and writable.
pub unsafe trait PhysMapper {
    /// Pointer to the byte at physical address `pa`.
    ///
    /// # Safety
    /// `pa` must be backed by memory this mapper covers.
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// View the bytes at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be covered by the mapper and suitably aligned for `T`.
    /// - No other reference to the same memory may be live for `'a`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }

    /// View the frame `page` as a paging structure of entry type `E`.
    ///
    /// # Safety
    /// As for [`phys_to_mut`](Self::phys_to_mut); additionally `page` must
    /// hold a table of the level `E` describes.
    #[inline]
    unsafe fn table_mut<'a, E: PageEntry>(&self, page: PhysicalPage<Size4K>) -> &'a mut PageTable<E> {
        unsafe { self.phys_to_mut(page.base()) }
    }

    /// `len` bytes starting at `pa` as a byte slice.
    ///
    /// # Safety
    /// As for [`phys_to_mut`](Self::phys_to_mut), for the whole range.
    #[inline]
    unsafe fn phys_to_slice<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.phys_to_ptr(pa), len) }
    }

    /// The full contents of one 4 KiB frame.
    ///
    /// # Safety
    /// As for [`phys_to_mut`](Self::phys_to_mut).
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn frame_bytes<'a>(&self, page: PhysicalPage<Size4K>) -> &'a mut [u8] {
        unsafe { self.phys_to_slice(page.base(), Size4K::SIZE as usize) }
    }
}
