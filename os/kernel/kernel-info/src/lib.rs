//! # Kernel Memory Configuration and Boot Inputs
//!
//! The shared configuration consumed by the memory-management crates: the
//! virtual layout constants, the [`MemoryLayout`](layout::MemoryLayout) value
//! built from them, and the memory map handed over by the boot stage.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  User space                     │
//! USER_HEAP_BASE        │    heap grows up                │ 0x0000_0000_4000_0000
//!                       │    ...                          │
//! USER_STACK_TOP        │    stack grows down             │ 0x0000_7fff_ffff_0000
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │  Non-canonical hole             │
//! KERNEL_STACKS_BASE    ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │  Kernel stacks + guards         │
//!                       │    (private per address space)  │
//! KERNEL_WINDOW_START   ├─────────────────────────────────┤ 0xffff_8080_0000_0000
//!                       │  Shared kernel window           │
//! HHDM_BASE             │    direct map of physical RAM   │ 0xffff_8880_0000_0000
//! KERNEL_HEAP_BASE      │    kernel heap arenas           │ 0xffff_c000_0000_0000
//! KERNEL_BASE           │    kernel text and data         │ 0xffff_ffff_8000_0000
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Everything at or above [`KERNEL_WINDOW_START`](memory::KERNEL_WINDOW_START)
//! is identical in every address space: a cloned address space references the
//! same page tables for that range instead of copying them. The kernel stack
//! slot just below it is private: a clone gets its own copy of every stack.
//!
//! ## Physical Memory
//!
//! Frames below [`LOWMEM_LIMIT`](memory::LOWMEM_LIMIT) (16 MiB) are kept in a
//! separate pool for legacy DMA-constrained devices and are only handed out on
//! explicit request.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod layout;
pub mod memory;
