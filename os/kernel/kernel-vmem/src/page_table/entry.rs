//! Entry codecs for all four levels.
//!
//! Every level shares the same 64-bit hardware layout ([`EntryBits`]); the
//! level only changes how bit 7 and the low address bits are interpreted:
//!
//! | Level | bit 7 | present entry references |
//! |-------|-------|--------------------------|
//! | L4 (PML4E) | reserved, must be 0 | a PDPT |
//! | L3 (PDPTE) | `PS` | a PD, or a 1 GiB frame if `PS=1` |
//! | L2 (PDE)   | `PS` | a PT, or a 2 MiB frame if `PS=1` |
//! | L1 (PTE)   | `PAT` | a 4 KiB frame |

use super::PageLevel;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Raw x86-64 paging entry, identical at every level.
///
/// The address field (bits 12..51) always holds a page-aligned physical
/// address; the setters below never store in-page bits.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct EntryBits {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User-accessible (bit 2).
    pub user: bool,
    /// Write-Through (bit 3).
    pub write_through: bool,
    /// Cache Disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5), set by the CPU.
    pub accessed: bool,
    /// Dirty (bit 6), set by the CPU on leaves; ignored in non-leaf entries.
    pub dirty: bool,
    /// `PS` at L3/L2, `PAT` at L1, reserved at L4 (bit 7).
    pub size_or_pat: bool,
    /// Global (bit 8); only meaningful on leaves.
    pub global: bool,
    /// OS-available low (bits 9..11).
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical address bits 51:12.
    #[bits(40)]
    phys_addr_51_12: u64,
    /// OS-available high (bits 52..58).
    #[bits(7)]
    pub os_available_high: u8,
    /// Protection Key (bits 59..62).
    #[bits(4)]
    pub protection_key: u8,
    /// No-Execute (bit 63).
    pub no_execute: bool,
}

impl EntryBits {
    /// The address field as a byte address (bits 12..51, low bits zero).
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_51_12() << 12)
    }

    /// Store `pa` in the address field, dropping the in-page bits.
    #[inline]
    pub const fn set_address(&mut self, pa: PhysicalAddress) {
        self.set_phys_addr_51_12((pa.as_u64() >> 12) & 0xFF_FFFF_FFFF);
    }
}

/// Individually addressable boolean attributes of an entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryFlag {
    Present,
    Writable,
    User,
    WriteThrough,
    CacheDisable,
    Accessed,
    Dirty,
    Global,
    NoExecute,
}

/// Permission and cache attributes of an entry, without the address and `PS`.
///
/// This is what callers pass in when creating leaves, and what
/// [`EntryKind`] reports back.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct PageFlags {
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub global: bool,
    pub no_execute: bool,
    #[bits(8)]
    __reserved: u8,
}

impl PageFlags {
    /// Kernel read/write data, not executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_writable(true).with_no_execute(true)
    }

    /// User read/write data, not executable.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::kernel_rw().with_user(true)
    }

    #[inline]
    const fn from_entry(bits: EntryBits) -> Self {
        Self::new()
            .with_writable(bits.writable())
            .with_user(bits.user())
            .with_write_through(bits.write_through())
            .with_cache_disable(bits.cache_disable())
            .with_accessed(bits.accessed())
            .with_dirty(bits.dirty())
            .with_global(bits.global())
            .with_no_execute(bits.no_execute())
    }

    #[inline]
    const fn apply(self, bits: EntryBits) -> EntryBits {
        bits.with_writable(self.writable())
            .with_user(self.user())
            .with_write_through(self.write_through())
            .with_cache_disable(self.cache_disable())
            .with_accessed(self.accessed())
            .with_dirty(self.dirty())
            .with_global(self.global())
            .with_no_execute(self.no_execute())
    }
}

/// Tagged view of an entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryKind {
    /// Not present.
    Empty,
    /// Points at the next-level table.
    Table(PhysicalPage<Size4K>, PageFlags),
    /// Maps a data frame: 4 KiB at L1, 2 MiB / 1 GiB for `PS=1` at L2 / L3.
    Leaf(PhysicalAddress, PageFlags),
}

/// Common accessors of the four entry codecs.
pub trait PageEntry: Copy + Eq + fmt::Debug {
    const LEVEL: PageLevel;

    /// The non-present, all-zero entry.
    const EMPTY: Self;

    fn from_bits(bits: EntryBits) -> Self;

    fn bits(self) -> EntryBits;

    #[inline]
    #[must_use]
    fn from_raw(raw: u64) -> Self {
        Self::from_bits(EntryBits::from_bits(raw))
    }

    #[inline]
    #[must_use]
    fn raw(self) -> u64 {
        self.bits().into_bits()
    }

    #[inline]
    #[must_use]
    fn is_present(self) -> bool {
        self.bits().present()
    }

    /// `true` for an L3/L2 entry with `PS=1`.
    #[inline]
    #[must_use]
    fn is_huge(self) -> bool {
        Self::LEVEL.supports_huge() && self.bits().size_or_pat()
    }

    #[must_use]
    fn get(self, flag: EntryFlag) -> bool {
        let b = self.bits();
        match flag {
            EntryFlag::Present => b.present(),
            EntryFlag::Writable => b.writable(),
            EntryFlag::User => b.user(),
            EntryFlag::WriteThrough => b.write_through(),
            EntryFlag::CacheDisable => b.cache_disable(),
            EntryFlag::Accessed => b.accessed(),
            EntryFlag::Dirty => b.dirty(),
            EntryFlag::Global => b.global(),
            EntryFlag::NoExecute => b.no_execute(),
        }
    }

    fn set(&mut self, flag: EntryFlag, value: bool) {
        let mut b = self.bits();
        match flag {
            EntryFlag::Present => b.set_present(value),
            EntryFlag::Writable => b.set_writable(value),
            EntryFlag::User => b.set_user(value),
            EntryFlag::WriteThrough => b.set_write_through(value),
            EntryFlag::CacheDisable => b.set_cache_disable(value),
            EntryFlag::Accessed => b.set_accessed(value),
            EntryFlag::Dirty => b.set_dirty(value),
            EntryFlag::Global => b.set_global(value),
            EntryFlag::NoExecute => b.set_no_execute(value),
        }
        *self = Self::from_bits(b);
    }

    /// Next-level table referenced by this entry (address bits 12..51).
    #[inline]
    #[must_use]
    fn table(self) -> PhysicalPage<Size4K> {
        self.bits().address().page()
    }

    /// Point this entry at the next-level table `page`; clears `PS`.
    #[inline]
    fn set_table(&mut self, page: PhysicalPage<Size4K>) {
        let mut b = self.bits();
        b.set_address(page.base());
        if Self::LEVEL != PageLevel::L1 {
            b.set_size_or_pat(false);
        }
        *self = Self::from_bits(b);
    }

    #[inline]
    #[must_use]
    fn flags(self) -> PageFlags {
        PageFlags::from_entry(self.bits())
    }

    /// A present entry pointing at a next-level table.
    ///
    /// Intermediate entries never restrict execution; `NX` is left clear.
    #[must_use]
    fn new_table(page: PhysicalPage<Size4K>, flags: PageFlags) -> Self {
        debug_assert!(Self::LEVEL != PageLevel::L1, "PT entries cannot reference tables");
        let mut e = Self::from_bits(
            flags
                .with_no_execute(false)
                .with_global(false)
                .apply(EntryBits::new().with_present(true)),
        );
        e.set_table(page);
        e
    }

    /// A present leaf mapping `frame`. At L3/L2 this sets `PS`.
    ///
    /// # Panics
    /// At L4, which cannot hold leaves.
    #[must_use]
    fn new_leaf(frame: PhysicalAddress, flags: PageFlags) -> Self {
        let mut b = flags.apply(EntryBits::new().with_present(true));
        match Self::LEVEL {
            PageLevel::L4 => panic!("PML4 entries cannot map frames"),
            PageLevel::L3 | PageLevel::L2 => {
                debug_assert!(frame.is_aligned_to(Self::LEVEL.entry_span()));
                b.set_size_or_pat(true);
            }
            PageLevel::L1 => {}
        }
        b.set_address(frame);
        Self::from_bits(b)
    }

    /// Decode the entry into its tagged form.
    ///
    /// # Panics
    /// If an L4 entry has the reserved `PS` bit set; this is page-table
    /// corruption and is not recoverable.
    fn kind(self) -> EntryKind {
        let b = self.bits();
        if !b.present() {
            return EntryKind::Empty;
        }
        let flags = self.flags();
        match Self::LEVEL {
            PageLevel::L4 => {
                assert!(
                    !b.size_or_pat(),
                    "corrupt PML4 entry {:#018x}: PS bit set",
                    b.into_bits()
                );
                EntryKind::Table(self.table(), flags)
            }
            PageLevel::L3 | PageLevel::L2 if b.size_or_pat() => EntryKind::Leaf(
                PhysicalAddress::new(b.into_bits() & Self::LEVEL.leaf_address_mask()),
                flags,
            ),
            PageLevel::L3 | PageLevel::L2 => EntryKind::Table(self.table(), flags),
            PageLevel::L1 => EntryKind::Leaf(b.address(), flags),
        }
    }
}

macro_rules! page_entry {
    ($(#[$meta:meta])* $name:ident, $level:expr) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq)]
        pub struct $name(EntryBits);

        impl PageEntry for $name {
            const LEVEL: PageLevel = $level;
            const EMPTY: Self = Self(EntryBits::new());

            #[inline]
            fn from_bits(bits: EntryBits) -> Self {
                Self(bits)
            }

            #[inline]
            fn bits(self) -> EntryBits {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::EMPTY
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#018x})", stringify!($name), self.0.into_bits())
            }
        }
    };
}

page_entry!(
    /// L4 entry (PML4E); always references a PDPT.
    #[doc(alias = "PML4E")]
    Pml4Entry,
    PageLevel::L4
);

page_entry!(
    /// L3 entry (PDPTE); references a PD or maps a 1 GiB page.
    #[doc(alias = "PDPTE")]
    PdptEntry,
    PageLevel::L3
);

page_entry!(
    /// L2 entry (PDE); references a PT or maps a 2 MiB page.
    #[doc(alias = "PDE")]
    PdEntry,
    PageLevel::L2
);

page_entry!(
    /// L1 entry (PTE); maps one 4 KiB page.
    #[doc(alias = "PTE")]
    PtEntry,
    PageLevel::L1
);
