use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
    /// Short human-readable name (`4K`, `2M`, `1G`).
    const NAME: &'static str;

    /// Mask selecting the in-page offset bits.
    #[inline]
    #[must_use]
    fn offset_mask() -> u64 {
        Self::SIZE - 1
    }
}

/// 4 KiB page (4096 bytes). The base granularity of every frame and mapping.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;

/// 2 MiB page, mapped by a PD entry with `PS=1`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;

/// 1 GiB page, mapped by a PDPT entry with `PS=1`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size1G;

macro_rules! page_size {
    ($ty:ident, $shift:literal, $name:literal) => {
        impl sealed::Sealed for $ty {}

        impl PageSize for $ty {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const NAME: &'static str = $name;
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }
    };
}

page_size!(Size4K, 12, "4K");
page_size!(Size2M, 21, "2M");
page_size!(Size1G, 30, "1G");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_hardware() {
        assert_eq!(Size4K::SIZE, 4096);
        assert_eq!(Size2M::SIZE, 2 * 1024 * 1024);
        assert_eq!(Size1G::SIZE, 1024 * 1024 * 1024);
        assert_eq!(Size2M::offset_mask(), 0x1F_FFFF);
    }
}
