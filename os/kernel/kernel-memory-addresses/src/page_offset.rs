use crate::PageSize;
use core::fmt;
use core::marker::PhantomData;

/// Byte offset inside a page of size `S`.
///
/// Always `< S::SIZE`; constructors mask the value instead of failing.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageOffset<S: PageSize> {
    value: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> PageOffset<S> {
    /// Build an offset from the low bits of `value`.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self {
            value: value & (S::SIZE - 1),
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.value
    }
}

impl<S: PageSize> fmt::Debug for PageOffset<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageOffset<{}>({:#X})", S::NAME, self.value)
    }
}
