use crate::{PageOffset, PageSize, PhysicalAddress};
use core::fmt;
use core::marker::PhantomData;

/// Physical memory page base for size `S`.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0000_0008_1234_5678);
/// let pp = pa.page::<Size2M>();
/// assert_eq!(pp.base().as_u64() & (Size2M::SIZE - 1), 0);
/// assert_eq!(pp.join(pa.offset::<Size2M>()), pa);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// Page containing `pa` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(pa: PhysicalAddress) -> Self {
        Self {
            base: pa.as_u64() & !(S::SIZE - 1),
            _size: PhantomData,
        }
    }

    /// Page with frame number `number` (`base = number << S::SHIFT`).
    #[inline]
    #[must_use]
    pub const fn from_number(number: u64) -> Self {
        Self {
            base: number << S::SHIFT,
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// Frame number (`base >> S::SHIFT`).
    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.base >> S::SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: PageOffset<S>) -> PhysicalAddress {
        PhysicalAddress::new(self.base + off.as_u64())
    }

    /// `true` if `pa` lies within this page.
    #[inline]
    #[must_use]
    pub const fn contains(self, pa: PhysicalAddress) -> bool {
        pa.as_u64() & !(S::SIZE - 1) == self.base
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:016X})", S::NAME, self.base)
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.base, S::NAME)
    }
}
