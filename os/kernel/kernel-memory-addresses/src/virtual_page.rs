use crate::{PageOffset, PageSize, VirtualAddress};
use core::fmt;
use core::marker::PhantomData;

/// Virtual memory page base for size `S`.
///
/// The virtual counterpart of [`PhysicalPage`](crate::PhysicalPage); used
/// wherever a whole page is named, e.g. for TLB invalidation.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    #[inline]
    #[must_use]
    pub const fn containing_address(va: VirtualAddress) -> Self {
        Self {
            base: va.as_u64() & !(S::SIZE - 1),
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.base)
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: PageOffset<S>) -> VirtualAddress {
        VirtualAddress::new(self.base + off.as_u64())
    }

    /// The page directly above this one; `None` at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.base.checked_add(S::SIZE) {
            Some(base) => Some(Self {
                base,
                _size: PhantomData,
            }),
            None => None,
        }
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>(0x{:016X})", S::NAME, self.base)
    }
}

impl<S: PageSize> TryFrom<VirtualAddress> for VirtualPage<S> {
    type Error = VirtualAddress;

    /// Succeeds only for addresses already aligned to `S`.
    #[inline]
    fn try_from(va: VirtualAddress) -> Result<Self, Self::Error> {
        if va.is_aligned_to(S::SIZE) {
            Ok(va.page())
        } else {
            Err(va)
        }
    }
}
