//! # Memory Layout Constants

/// End (exclusive) of the userspace VA range: the top of the lower canonical half.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// First address of the shared kernel window (PML4 slots 257..512).
///
/// PML4 slot 256 stays private to each address space and holds its kernel stacks.
pub const KERNEL_WINDOW_START: u64 = 0xffff_8080_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Physical frames below this address form the low-memory pool.
pub const LOWMEM_LIMIT: u64 = 16 * 1024 * 1024;

/// Kernel heap arenas are carved from this range (one PML4 slot).
pub const KERNEL_HEAP_BASE: u64 = 0xffff_c000_0000_0000;

/// End (exclusive) of the kernel heap range.
pub const KERNEL_HEAP_END: u64 = 0xffff_c080_0000_0000;

/// Kernel stacks are handed out upwards from here (PML4 slot 256, per address space).
pub const KERNEL_STACKS_BASE: u64 = 0xffff_8000_0000_0000;

/// End (exclusive) of the kernel stack range.
pub const KERNEL_STACKS_END: u64 = 0xffff_8080_0000_0000;

/// The size of a kernel stack in debug builds.
#[cfg(debug_assertions)]
pub const KERNEL_STACK_SIZE: u64 = 32 * 1024;

/// The size of a kernel stack in release builds.
#[cfg(not(debug_assertions))]
pub const KERNEL_STACK_SIZE: u64 = 32 * 1024;

/// Unmapped bytes left below every kernel stack so an overflow faults.
pub const KERNEL_STACK_GUARD: u64 = 4096;

/// Top (exclusive) of the initial user stack.
pub const USER_STACK_TOP: u64 = 0x0000_7fff_ffff_0000;

/// Default size of a user stack.
pub const USER_STACK_SIZE: u64 = 64 * 1024;

/// Start of the user heap.
pub const USER_HEAP_BASE: u64 = 0x0000_0000_4000_0000;

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(4096));
    assert!(KERNEL_STACK_GUARD.is_multiple_of(4096));
    assert!(USERSPACE_END <= KERNEL_WINDOW_START);
    assert!(HHDM_BASE >= KERNEL_WINDOW_START);
    assert!(KERNEL_HEAP_BASE >= KERNEL_WINDOW_START && KERNEL_HEAP_BASE < KERNEL_HEAP_END);
    assert!(KERNEL_STACKS_BASE >= USERSPACE_END && KERNEL_STACKS_END <= KERNEL_WINDOW_START);
    assert!(KERNEL_BASE >= KERNEL_HEAP_END);
    assert!(USER_STACK_TOP <= USERSPACE_END);
    assert!(USER_HEAP_BASE < USER_STACK_TOP - USER_STACK_SIZE);
};
