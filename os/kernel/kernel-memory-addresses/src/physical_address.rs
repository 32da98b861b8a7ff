use crate::{PageOffset, PageSize, PhysicalPage};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Physical memory address (machine bus address).
///
/// A zero-cost wrapper over `u64` so physical and virtual values cannot be
/// mixed by accident. Carries no alignment guarantee of its own; use
/// [`page`](Self::page) to obtain an aligned [`PhysicalPage`].
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
/// let (pp, po) = pa.split::<Size4K>();
/// assert_eq!(pp.join(po), pa);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// `true` if the address is a multiple of `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::from_addr(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> PageOffset<S> {
        PageOffset::new(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (PhysicalPage<S>, PageOffset<S>) {
        (self.page::<S>(), self.offset::<S>())
    }

    /// Add `rhs` bytes, returning `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl<S: PageSize> From<PhysicalPage<S>> for PhysicalAddress {
    #[inline]
    fn from(value: PhysicalPage<S>) -> Self {
        value.base()
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
