//! # Memory Layout Configuration
//!
//! [`MemoryLayout`] bundles the virtual ranges the address space manager
//! carves stacks and heaps from. The kernel uses [`MemoryLayout::DEFAULT`];
//! tests build their own values.

use crate::memory;
use core::ops::Range;
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};

/// Bytes covered by one PML4 slot (512 GiB).
const L4_SLOT_SIZE: u64 = 1 << 39;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("{0} is not page aligned")]
    Unaligned(&'static str),
    #[error("{0} is an empty range")]
    EmptyRange(&'static str),
    #[error("the shared kernel window must start on a PML4 slot boundary")]
    WindowUnaligned,
    #[error("{0} lies outside the shared kernel window")]
    OutsideKernelWindow(&'static str),
    #[error("{0} overlaps {1}")]
    Overlap(&'static str, &'static str),
    #[error("{0} reaches into kernel space")]
    NotUserSpace(&'static str),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemoryLayout {
    /// Base of the higher-half direct map.
    pub hhdm_base: u64,
    /// End (exclusive) of user space.
    pub user_end: u64,
    /// First address of the shared kernel window; it extends to the top of the address space.
    pub kernel_window_start: u64,
    /// Kernel heap range `[base, end)`.
    pub kernel_heap: Range<u64>,
    /// Kernel stack range `[base, end)`: kernel half, below the shared window.
    pub kernel_stacks: Range<u64>,
    pub kernel_stack_size: u64,
    pub kernel_stack_guard: u64,
    pub user_stack_top: u64,
    pub user_stack_size: u64,
    pub user_heap_base: u64,
    /// Frames below this physical address belong to the low-memory pool.
    pub lowmem_limit: u64,
}

impl MemoryLayout {
    pub const DEFAULT: Self = Self {
        hhdm_base: memory::HHDM_BASE,
        user_end: memory::USERSPACE_END,
        kernel_window_start: memory::KERNEL_WINDOW_START,
        kernel_heap: memory::KERNEL_HEAP_BASE..memory::KERNEL_HEAP_END,
        kernel_stacks: memory::KERNEL_STACKS_BASE..memory::KERNEL_STACKS_END,
        kernel_stack_size: memory::KERNEL_STACK_SIZE,
        kernel_stack_guard: memory::KERNEL_STACK_GUARD,
        user_stack_top: memory::USER_STACK_TOP,
        user_stack_size: memory::USER_STACK_SIZE,
        user_heap_base: memory::USER_HEAP_BASE,
        lowmem_limit: memory::LOWMEM_LIMIT,
    };

    /// `true` if `va` lies in the shared kernel window.
    #[inline]
    #[must_use]
    pub const fn in_kernel_window(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.kernel_window_start
    }

    /// PML4 slots covered by the shared kernel window.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn kernel_window_slots(&self) -> Range<usize> {
        ((self.kernel_window_start >> 39) & 0x1FF) as usize..512
    }

    /// Check alignment, ordering and containment of all ranges.
    ///
    /// The kernel heap must lie in the shared window; kernel stacks must lie in
    /// the kernel half below it.
    ///
    /// # Errors
    /// The first [`LayoutError`] found.
    pub fn validate(&self) -> Result<(), LayoutError> {
        let aligned = [
            ("hhdm_base", self.hhdm_base),
            ("user_end", self.user_end),
            ("kernel_heap.start", self.kernel_heap.start),
            ("kernel_heap.end", self.kernel_heap.end),
            ("kernel_stacks.start", self.kernel_stacks.start),
            ("kernel_stacks.end", self.kernel_stacks.end),
            ("kernel_stack_size", self.kernel_stack_size),
            ("kernel_stack_guard", self.kernel_stack_guard),
            ("user_stack_top", self.user_stack_top),
            ("user_stack_size", self.user_stack_size),
            ("user_heap_base", self.user_heap_base),
            ("lowmem_limit", self.lowmem_limit),
        ];
        for (name, value) in aligned {
            if !value.is_multiple_of(Size4K::SIZE) {
                return Err(LayoutError::Unaligned(name));
            }
        }

        if !self.kernel_window_start.is_multiple_of(L4_SLOT_SIZE) {
            return Err(LayoutError::WindowUnaligned);
        }

        if self.kernel_heap.is_empty() {
            return Err(LayoutError::EmptyRange("kernel_heap"));
        }
        if self.kernel_heap.start < self.kernel_window_start {
            return Err(LayoutError::OutsideKernelWindow("kernel_heap"));
        }
        if self.kernel_stacks.is_empty() {
            return Err(LayoutError::EmptyRange("kernel_stacks"));
        }
        if self.kernel_stacks.start < self.user_end {
            return Err(LayoutError::Overlap("kernel_stacks", "user space"));
        }
        if self.kernel_stacks.end > self.kernel_window_start {
            return Err(LayoutError::Overlap("kernel_stacks", "kernel window"));
        }
        if self.kernel_stack_size == 0 {
            return Err(LayoutError::EmptyRange("kernel_stack_size"));
        }

        if self.user_end > self.kernel_window_start {
            return Err(LayoutError::NotUserSpace("user_end"));
        }
        if self.user_stack_top > self.user_end {
            return Err(LayoutError::NotUserSpace("user_stack_top"));
        }
        if self.user_stack_size == 0 {
            return Err(LayoutError::EmptyRange("user_stack_size"));
        }
        let stack_bottom = self.user_stack_top.saturating_sub(self.user_stack_size);
        if self.user_heap_base >= stack_bottom {
            return Err(LayoutError::Overlap("user_heap_base", "user stack"));
        }

        Ok(())
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        assert_eq!(MemoryLayout::DEFAULT.validate(), Ok(()));
        assert_eq!(MemoryLayout::DEFAULT.kernel_window_slots(), 257..512);
    }

    #[test]
    fn window_membership() {
        let layout = MemoryLayout::DEFAULT;
        assert!(layout.in_kernel_window(VirtualAddress::new(memory::KERNEL_BASE)));
        assert!(layout.in_kernel_window(VirtualAddress::new(memory::HHDM_BASE)));
        assert!(!layout.in_kernel_window(VirtualAddress::new(memory::USER_STACK_TOP)));
        assert!(!layout.in_kernel_window(VirtualAddress::new(memory::KERNEL_STACKS_BASE)));
    }

    #[test]
    fn rejects_unaligned_values() {
        let layout = MemoryLayout {
            kernel_stack_size: 1000,
            ..MemoryLayout::DEFAULT
        };
        assert_eq!(
            layout.validate(),
            Err(LayoutError::Unaligned("kernel_stack_size"))
        );
    }

    #[test]
    fn rejects_heap_outside_window() {
        let layout = MemoryLayout {
            kernel_heap: 0x1000_0000..0x2000_0000,
            ..MemoryLayout::DEFAULT
        };
        assert_eq!(
            layout.validate(),
            Err(LayoutError::OutsideKernelWindow("kernel_heap"))
        );
    }

    #[test]
    fn rejects_stacks_inside_shared_window() {
        let layout = MemoryLayout {
            kernel_stacks: memory::KERNEL_HEAP_BASE..memory::KERNEL_HEAP_END,
            ..MemoryLayout::DEFAULT
        };
        assert_eq!(
            layout.validate(),
            Err(LayoutError::Overlap("kernel_stacks", "kernel window"))
        );
    }

    #[test]
    fn rejects_window_off_slot_boundary() {
        let layout = MemoryLayout {
            kernel_window_start: 0xffff_8000_0020_0000,
            ..MemoryLayout::DEFAULT
        };
        assert_eq!(layout.validate(), Err(LayoutError::WindowUnaligned));
    }

    #[test]
    fn rejects_heap_inside_user_stack() {
        let layout = MemoryLayout {
            user_heap_base: memory::USER_STACK_TOP - 0x1000,
            ..MemoryLayout::DEFAULT
        };
        assert_eq!(
            layout.validate(),
            Err(LayoutError::Overlap("user_heap_base", "user stack"))
        );
    }
}
