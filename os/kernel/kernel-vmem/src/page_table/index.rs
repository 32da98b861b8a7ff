use kernel_memory_addresses::VirtualAddress;

/// One of the four paging levels, root first.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageLevel {
    /// PML4: VA bits `[47:39]`.
    L4,
    /// PDPT: VA bits `[38:30]`; a leaf here maps 1 GiB.
    L3,
    /// PD: VA bits `[29:21]`; a leaf here maps 2 MiB.
    L2,
    /// PT: VA bits `[20:12]`; always a 4 KiB leaf.
    L1,
}

impl PageLevel {
    /// Bit position of this level's index inside a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::L4 => 39,
            Self::L3 => 30,
            Self::L2 => 21,
            Self::L1 => 12,
        }
    }

    /// Bytes of virtual address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    #[inline]
    #[must_use]
    pub const fn next_lower(self) -> Option<Self> {
        match self {
            Self::L4 => Some(Self::L3),
            Self::L3 => Some(Self::L2),
            Self::L2 => Some(Self::L1),
            Self::L1 => None,
        }
    }

    /// Whether the `PS` bit turns an entry at this level into a leaf.
    #[inline]
    #[must_use]
    pub const fn supports_huge(self) -> bool {
        matches!(self, Self::L3 | Self::L2)
    }

    /// Mask of the physical address bits a *leaf* entry at this level stores.
    ///
    /// For huge leaves the low bits of the address field hold PAT/reserved bits.
    #[inline]
    #[must_use]
    pub const fn leaf_address_mask(self) -> u64 {
        const MAX_PHYS: u64 = 0x000F_FFFF_FFFF_FFFF;
        MAX_PHYS & !(self.entry_span() - 1)
    }

    /// Index of `va` in a table at this level.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex::new(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }
}

/// Index into one 512-entry table.
///
/// Range is `0..512` (checked in debug builds).
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 512);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// All 512 indices in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..512).map(Self::new)
    }
}

/// Split `va` into its L4, L3, L2 and L1 indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> [TableIndex; 4] {
    [
        PageLevel::L4.index_of(va),
        PageLevel::L3.index_of(va),
        PageLevel::L2.index_of(va),
        PageLevel::L1.index_of(va),
    ]
}

/// Compose a canonical virtual address from four table indices (offset zero).
///
/// Bit 47 is sign-extended into bits 48..63.
#[inline]
#[must_use]
pub const fn join_indices(indices: [TableIndex; 4]) -> VirtualAddress {
    let raw = ((indices[0].0 as u64) << 39)
        | ((indices[1].0 as u64) << 30)
        | ((indices[2].0 as u64) << 21)
        | ((indices[3].0 as u64) << 12);
    let canonical = if raw & (1 << 47) != 0 {
        raw | 0xFFFF_0000_0000_0000
    } else {
        raw
    };
    VirtualAddress::new(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_hardware_bit_ranges() {
        let va = VirtualAddress::new(0xFFFF_8888_0123_4567);
        let [i4, i3, i2, i1] = split_indices(va);
        assert_eq!(i4.as_usize(), ((0xFFFF_8888_0123_4567_u64 >> 39) & 0x1FF) as usize);
        assert_eq!(i3.as_usize(), ((0xFFFF_8888_0123_4567_u64 >> 30) & 0x1FF) as usize);
        assert_eq!(i2.as_usize(), ((0xFFFF_8888_0123_4567_u64 >> 21) & 0x1FF) as usize);
        assert_eq!(i1.as_usize(), 0x134);
    }

    #[test]
    fn join_reverses_split_and_sign_extends() {
        for raw in [
            0x0000_0000_0040_1000_u64,
            0x0000_7FFF_FFFF_F000,
            0xFFFF_8000_0000_0000,
            0xFFFF_FFFF_8000_0000,
        ] {
            let va = VirtualAddress::new(raw);
            assert_eq!(join_indices(split_indices(va)), va);
        }
    }

    #[test]
    fn leaf_masks_drop_in_page_bits() {
        assert_eq!(PageLevel::L1.leaf_address_mask(), 0x000F_FFFF_FFFF_F000);
        assert_eq!(PageLevel::L2.leaf_address_mask(), 0x000F_FFFF_FFE0_0000);
        assert_eq!(PageLevel::L3.leaf_address_mask(), 0x000F_FFFF_C000_0000);
        assert_eq!(PageLevel::L3.next_lower(), Some(PageLevel::L2));
        assert_eq!(PageLevel::L1.next_lower(), None);
    }
}
