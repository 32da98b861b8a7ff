//! # Kernel Memory Management
//!
//! Physical frames, address spaces and heaps for an SMP kernel.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ Heaps: BumpHeap, ChunkHeap, SlabHeap (LockedHeap)    │ policy
//! └──────────────▲───────────────────────────────────────┘
//!                │ one HeapArena
//! ┌──────────────┴───────────────────────────────────────┐
//! │ Vmm: mapping list, page-table tree, clone, user copy │
//! └──────────────▲───────────────────────────────────────┘
//!                │ Mapping::create / drop
//! ┌──────────────┴───────────────────────────────────────┐
//! │ PhysicalMemoryManager: regions of FrameBitmaps       │ mechanism
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! * [`pmm`]: the physical frame allocator. Regions with one bit per 4 KiB
//!   frame, a separate low-memory pool and boot-time initialization from the
//!   firmware memory map.
//! * [`mapping`]: a [`Mapping`] owns the frames backing one virtual range and
//!   returns them to the PMM when dropped.
//! * [`vmm`]: one [`Vmm`] per address space. Sorted mapping list, page-table
//!   frames, map/unmap with TLB shootdown, stack and heap placement, cloning
//!   and the checked copy to and from user memory.
//! * [`heap`]: allocation policies over a single arena mapped by the kernel
//!   address space, and the [`LockedHeap`] global-allocator adapter.
//! * [`context`]: the [`MemoryContext`] bundling PMM, physical mapper, TLB
//!   shootdown and [`MemoryLayout`](kernel_info::layout::MemoryLayout).
//!   It is built once at boot and passed by reference; there are no global
//!   allocator instances.
//!
//! ## Boot sequence
//!
//! ```ignore
//! let pmm = unsafe { PhysicalMemoryManager::from_memory_map(&map, &mapper, LOWMEM_LIMIT)? };
//! let ctx = MemoryContext::new(pmm, mapper, tlb, MemoryLayout::DEFAULT)?;
//! let kernel = ctx.kernel_space()?;
//! HEAP.init(ChunkHeap::new(kernel.allocate_kernel_heap(HEAP_SIZE)?)?);
//! ```
//!
//! ## Failure model
//!
//! Running out of frames or virtual space is reported through the error
//! enums ([`PmmError`], [`VmmError`], [`MappingError`], [`HeapError`]).
//! Corrupted bookkeeping (double frees, frees of foreign frames or pointers,
//! malformed page tables) panics.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

extern crate alloc;

pub mod context;
pub mod heap;
pub mod mapping;
pub mod pmm;
pub mod vmm;

pub use crate::context::MemoryContext;
pub use crate::heap::{
    BumpHeap, ChunkHeap, HeapAllocator, HeapArena, HeapError, HeapStats, LockedHeap, SlabHeap,
};
pub use crate::mapping::{Mapping, MappingError, MappingFlags, Sharing};
pub use crate::pmm::{PhysicalFrame, PhysicalMemoryManager, PmmError};
pub use crate::vmm::{Vmm, VmmError};
