use super::{PageEntry, PdEntry, PdptEntry, Pml4Entry, PtEntry, TableIndex};

/// Number of entries in every paging structure.
pub const ENTRIES_PER_TABLE: usize = 512;

/// One paging structure: 512 entries, exactly one 4 KiB frame.
#[repr(C, align(4096))]
pub struct PageTable<E: PageEntry> {
    entries: [E; ENTRIES_PER_TABLE],
}

#[doc(alias = "PML4")]
pub type Pml4Table = PageTable<Pml4Entry>;
#[doc(alias = "PDPT")]
pub type PdptTable = PageTable<PdptEntry>;
#[doc(alias = "PD")]
pub type PdTable = PageTable<PdEntry>;
#[doc(alias = "PT")]
pub type PtTable = PageTable<PtEntry>;

const _: () = {
    assert!(size_of::<PtTable>() == 4096);
    assert!(align_of::<Pml4Table>() == 4096);
};

impl<E: PageEntry> PageTable<E> {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [E::EMPTY; ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, i: TableIndex) -> E {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub fn set(&mut self, i: TableIndex, e: E) {
        self.entries[i.as_usize()] = e;
    }

    /// Mark every entry non-present.
    #[inline]
    pub fn clear(&mut self) {
        self.entries.fill(E::EMPTY);
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }

    /// Present entries with their indices, ascending.
    pub fn present(&self) -> impl Iterator<Item = (TableIndex, E)> + '_ {
        TableIndex::all()
            .map(|i| (i, self.get(i)))
            .filter(|(_, e)| e.is_present())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::PageFlags;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn set_get_and_present_iteration() {
        let mut t = PtTable::zeroed();
        assert!(t.is_empty());
        let e = PtEntry::new_leaf(PhysicalAddress::new(0x7000), PageFlags::kernel_rw());
        t.set(TableIndex::new(3), e);
        t.set(TableIndex::new(511), e);
        assert_eq!(t.get(TableIndex::new(3)), e);
        let idx: Vec<_> = t.present().map(|(i, _)| i.as_usize()).collect();
        assert_eq!(idx, [3, 511]);
        t.clear();
        assert!(t.is_empty());
    }
}
