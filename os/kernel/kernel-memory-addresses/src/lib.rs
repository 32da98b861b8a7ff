//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and page bases used by
//! the page-table and allocator crates.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical memory (frames, MMIO). |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Page-table translated memory. |
//! | [`PageOffset<S>`] | A byte offset inside a page of size `S`. |
//!
//! Three x86-64 page sizes are provided as marker types implementing
//! [`PageSize`]: [`Size4K`], [`Size2M`] and [`Size1G`].
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0xFFFF_FFFF_8000_1000);
//! assert_eq!(off.as_u64(), 0x234);
//! assert_eq!(page.join(off), va);
//! ```
//!
//! All types are `#[repr(transparent)]` over `u64`; the size parameter is a
//! `PhantomData` marker and costs nothing at runtime.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::inline_always)]

mod page_offset;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use page_offset::PageOffset;
pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_physical() {
        let pa = PhysicalAddress::new(0x1234_5678);
        let (page, off) = pa.split::<Size4K>();
        assert_eq!(page.base().as_u64(), 0x1234_5000);
        assert_eq!(off.as_u64(), 0x678);
        assert_eq!(page.join(off), pa);
    }

    #[test]
    fn frame_numbers() {
        let page = PhysicalPage::<Size4K>::from_number(0x100);
        assert_eq!(page.base(), PhysicalAddress::new(0x10_0000));
        assert_eq!(page.number(), 0x100);
        assert!(page.contains(PhysicalAddress::new(0x10_0FFF)));
        assert!(!page.contains(PhysicalAddress::new(0x10_1000)));
    }

    #[test]
    fn huge_page_alignment() {
        let pa = PhysicalAddress::new(0x0000_0008_1234_5678);
        assert_eq!(pa.page::<Size2M>().base().as_u64(), 0x0000_0008_1220_0000);
        assert_eq!(pa.page::<Size1G>().base().as_u64(), 0x0000_0008_0000_0000);
    }

    #[test]
    fn virtual_alignment_helpers() {
        let va = VirtualAddress::new(0x1001);
        assert!(!va.is_aligned_to(Size4K::SIZE));
        assert_eq!(va.checked_align_up(Size4K::SIZE), Some(VirtualAddress::new(0x2000)));
        assert_eq!(va.align_down(Size4K::SIZE), VirtualAddress::new(0x1000));
        assert_eq!(VirtualAddress::new(u64::MAX).checked_align_up(Size4K::SIZE), None);
        assert_eq!(
            VirtualAddress::new(0x3000).checked_offset_from(VirtualAddress::new(0x1000)),
            Some(0x2000)
        );
        assert_eq!(
            VirtualAddress::new(0x1000).checked_offset_from(VirtualAddress::new(0x3000)),
            None
        );
    }

    #[test]
    fn virtual_page_next_saturates() {
        let top = VirtualAddress::new(u64::MAX).page::<Size4K>();
        assert_eq!(top.next(), None);
        let p = VirtualAddress::new(0x1000).page::<Size4K>();
        assert_eq!(p.next().map(VirtualPage::base), Some(VirtualAddress::new(0x2000)));
    }

    #[test]
    fn page_try_from_requires_alignment() {
        assert!(VirtualPage::<Size4K>::try_from(VirtualAddress::new(0x2000)).is_ok());
        assert_eq!(
            VirtualPage::<Size4K>::try_from(VirtualAddress::new(0x2001)),
            Err(VirtualAddress::new(0x2001))
        );
    }

    #[test]
    fn debug_formats() {
        assert_eq!(
            format!("{:?}", PhysicalAddress::new(0x1000)),
            "PA(0x0000000000001000)"
        );
        assert_eq!(
            format!("{:?}", VirtualAddress::new(0x1000)),
            "VA(0x0000000000001000)"
        );
    }
}
