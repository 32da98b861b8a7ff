//! Walking and mutating one page-table tree.

use crate::page_table::{
    EntryFlag, EntryKind, PageEntry, PageFlags, PageLevel, PdEntry, PdptEntry, Pml4Entry,
    PtEntry, PageTable,
};
use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::{
    PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// No frame was available for a new table at the given level.
    #[error("out of memory allocating a {0:?} table")]
    OutOfMemory(PageLevel),
    #[error("{0:?} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("{0:?} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("a huge page already covers {0:?}")]
    HugePageInTheWay(VirtualAddress),
}

/// Tables created and entries widened by one [`PageTableWalker::map_4k`]
/// call, root-most first.
///
/// Created tables always form the tail of the chain for one address: once a
/// level was missing, every level below it was created too. Unlinking the
/// first one therefore detaches all of them. Widened entries sit above them.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CreatedTables {
    /// Level of the table whose entry now references `pages[0]`.
    linked_at: Option<PageLevel>,
    pages: [Option<PhysicalPage<Size4K>>; 3],
    /// Table, slot and previous raw value of each entry whose access bits grew.
    widened: [Option<(PhysicalPage<Size4K>, usize, u64)>; 3],
}

impl CreatedTables {
    /// Nothing was created or widened.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.linked_at.is_none() && self.widened[0].is_none()
    }

    pub fn pages(&self) -> impl Iterator<Item = PhysicalPage<Size4K>> + '_ {
        self.pages.iter().flatten().copied()
    }

    fn push(&mut self, parent: PageLevel, page: PhysicalPage<Size4K>) {
        if self.linked_at.is_none() {
            self.linked_at = Some(parent);
        }
        if let Some(slot) = self.pages.iter_mut().find(|p| p.is_none()) {
            *slot = Some(page);
        }
    }

    fn widen(&mut self, table: PhysicalPage<Size4K>, idx: usize, old: u64) {
        if let Some(slot) = self.widened.iter_mut().find(|w| w.is_none()) {
            *slot = Some((table, idx, old));
        }
    }
}

/// Walks one PML4 tree through a [`PhysMapper`].
///
/// The walker owns nothing: table frames come from the caller's
/// [`FrameAlloc`] and the caller decides when they are released. It only ever
/// installs 4 KiB leaves; TLB maintenance is the caller's responsibility.
pub struct PageTableWalker<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> PageTableWalker<'m, M> {
    /// # Safety
    /// - `root` must be a PML4 reachable through `mapper`, and every table
    ///   below it must be too.
    /// - For the walker's lifetime the caller must serialize all access to
    ///   the tree (e.g. by holding the owning address space's lock).
    #[inline]
    #[must_use]
    pub const unsafe fn new(root: PhysicalPage<Size4K>, mapper: &'m M) -> Self {
        Self { root, mapper }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    fn table<E: PageEntry>(&self, page: PhysicalPage<Size4K>) -> &'m mut PageTable<E> {
        // SAFETY: guaranteed by the contract of `new`.
        unsafe { self.mapper.table_mut(page) }
    }

    /// Level-agnostic view of a table, for operations on raw entries.
    #[inline]
    fn raw_table(&self, page: PhysicalPage<Size4K>) -> &'m mut [u64; 512] {
        // SAFETY: guaranteed by the contract of `new`.
        unsafe { self.mapper.phys_to_mut(page.base()) }
    }

    fn descend<E: PageEntry>(entry: E, va: VirtualAddress) -> Result<Option<PhysicalPage<Size4K>>, MapError> {
        match entry.kind() {
            EntryKind::Empty => Ok(None),
            EntryKind::Table(next, _) => Ok(Some(next)),
            EntryKind::Leaf(..) => Err(MapError::HugePageInTheWay(va)),
        }
    }

    /// Make the `E`-level entry for `va` in `page` reference a table, creating
    /// and zeroing one if necessary.
    ///
    /// Existing intermediate entries are widened to allow `flags`' user and
    /// write access; the leaf decides the effective permissions.
    fn ensure_next<E: PageEntry, A: FrameAlloc>(
        &self,
        page: PhysicalPage<Size4K>,
        va: VirtualAddress,
        flags: PageFlags,
        alloc: &mut A,
        created: &mut CreatedTables,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let table = self.table::<E>(page);
        let idx = E::LEVEL.index_of(va);
        let entry = table.get(idx);

        if let Some(next) = Self::descend(entry, va)? {
            let mut widened = entry;
            if flags.user() {
                widened.set(EntryFlag::User, true);
            }
            if flags.writable() {
                widened.set(EntryFlag::Writable, true);
            }
            if widened != entry {
                created.widen(page, idx.as_usize(), self.raw_table(page)[idx.as_usize()]);
                table.set(idx, widened);
            }
            return Ok(next);
        }

        let lower = E::LEVEL.next_lower().unwrap_or(PageLevel::L1);
        let Some(new) = alloc.alloc_4k() else {
            return Err(MapError::OutOfMemory(lower));
        };
        self.raw_table(new).fill(0);
        table.set(idx, E::new_table(new, flags));
        created.push(E::LEVEL, new);
        log::trace!("created {lower:?} table {new} for {va:?}");
        Ok(new)
    }

    /// Map the 4 KiB page `page` to `frame`, creating missing tables.
    ///
    /// On success returns the tables this call created, so the caller can
    /// undo them with [`release`](Self::release). On failure the tree is left
    /// exactly as it was.
    ///
    /// # Errors
    /// - [`MapError::OutOfMemory`] if a table frame could not be allocated.
    /// - [`MapError::AlreadyMapped`] if a 4 KiB leaf is already present.
    /// - [`MapError::HugePageInTheWay`] if a 2 MiB / 1 GiB leaf covers `page`.
    pub fn map_4k<A: FrameAlloc>(
        &self,
        page: VirtualPage<Size4K>,
        frame: PhysicalPage<Size4K>,
        flags: PageFlags,
        alloc: &mut A,
    ) -> Result<CreatedTables, MapError> {
        let mut created = CreatedTables::default();
        match self.try_map_4k(page.base(), frame, flags, alloc, &mut created) {
            Ok(()) => Ok(created),
            Err(e) => {
                self.release(page, created, alloc);
                Err(e)
            }
        }
    }

    fn try_map_4k<A: FrameAlloc>(
        &self,
        va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        flags: PageFlags,
        alloc: &mut A,
        created: &mut CreatedTables,
    ) -> Result<(), MapError> {
        let pdpt = self.ensure_next::<Pml4Entry, _>(self.root, va, flags, alloc, created)?;
        let pd = self.ensure_next::<PdptEntry, _>(pdpt, va, flags, alloc, created)?;
        let pt = self.ensure_next::<PdEntry, _>(pd, va, flags, alloc, created)?;

        let table = self.table::<PtEntry>(pt);
        let idx = PageLevel::L1.index_of(va);
        if table.get(idx).is_present() {
            return Err(MapError::AlreadyMapped(va));
        }
        table.set(idx, PtEntry::new_leaf(frame.base(), flags));
        Ok(())
    }

    /// Unlink and free the tables a successful [`map_4k`](Self::map_4k) of
    /// `page` created, and restore the entries it widened.
    ///
    /// When undoing several map calls, release them in reverse order: a later
    /// call may have created tables below an earlier call's tables.
    pub fn release<A: FrameAlloc>(
        &self,
        page: VirtualPage<Size4K>,
        created: CreatedTables,
        alloc: &mut A,
    ) {
        if let Some(linked_at) = created.linked_at {
            self.unlink(page.base(), linked_at);
            for frame in created.pages() {
                alloc.free_4k(frame);
            }
        }
        for &(table, idx, old) in created.widened.iter().flatten().rev() {
            self.raw_table(table)[idx] = old;
        }
    }

    /// Clear the `linked_at` entry on the path to `va`.
    fn unlink(&self, va: VirtualAddress, linked_at: PageLevel) {
        let mut table = self.root;
        let mut level = PageLevel::L4;
        while level != linked_at {
            let raw = self.raw_table(table)[level.index_of(va).as_usize()];
            table = PhysicalAddress::new(raw & PageLevel::L1.leaf_address_mask()).page();
            // Created tables are never linked from a PT, so this stops at L2.
            level = level.next_lower().unwrap_or(linked_at);
        }
        self.raw_table(table)[linked_at.index_of(va).as_usize()] = 0;
    }

    /// Clear the 4 KiB leaf for `page` and return the frame it mapped.
    ///
    /// Intermediate tables are left in place.
    ///
    /// # Errors
    /// - [`MapError::NotMapped`] if no 4 KiB leaf is present.
    /// - [`MapError::HugePageInTheWay`] if a huge leaf covers `page`.
    pub fn unmap_4k(&self, page: VirtualPage<Size4K>) -> Result<PhysicalPage<Size4K>, MapError> {
        let va = page.base();
        let not_mapped = MapError::NotMapped(va);

        let pml4 = self.table::<Pml4Entry>(self.root);
        let pdpt = Self::descend(pml4.get(PageLevel::L4.index_of(va)), va)?.ok_or(not_mapped)?;
        let pdpt = self.table::<PdptEntry>(pdpt);
        let pd = Self::descend(pdpt.get(PageLevel::L3.index_of(va)), va)?.ok_or(not_mapped)?;
        let pd = self.table::<PdEntry>(pd);
        let pt = Self::descend(pd.get(PageLevel::L2.index_of(va)), va)?.ok_or(not_mapped)?;
        let pt = self.table::<PtEntry>(pt);

        let idx = PageLevel::L1.index_of(va);
        match pt.get(idx).kind() {
            EntryKind::Leaf(frame, _) => {
                pt.set(idx, PtEntry::EMPTY);
                Ok(frame.page())
            }
            _ => Err(not_mapped),
        }
    }

    /// Translate `va` to the physical address it maps to, with the leaf's flags.
    ///
    /// Honors 1 GiB and 2 MiB leaves.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<(PhysicalAddress, PageFlags)> {
        fn resolve(base: PhysicalAddress, level: PageLevel, va: VirtualAddress) -> PhysicalAddress {
            base + (va.as_u64() & (level.entry_span() - 1))
        }

        let pdpt = match self.table::<Pml4Entry>(self.root).get(PageLevel::L4.index_of(va)).kind() {
            EntryKind::Table(next, _) => next,
            EntryKind::Empty | EntryKind::Leaf(..) => return None,
        };
        let pd = match self.table::<PdptEntry>(pdpt).get(PageLevel::L3.index_of(va)).kind() {
            EntryKind::Table(next, _) => next,
            EntryKind::Leaf(base, flags) => return Some((resolve(base, PageLevel::L3, va), flags)),
            EntryKind::Empty => return None,
        };
        let pt = match self.table::<PdEntry>(pd).get(PageLevel::L2.index_of(va)).kind() {
            EntryKind::Table(next, _) => next,
            EntryKind::Leaf(base, flags) => return Some((resolve(base, PageLevel::L2, va), flags)),
            EntryKind::Empty => return None,
        };
        match self.table::<PtEntry>(pt).get(PageLevel::L1.index_of(va)).kind() {
            EntryKind::Leaf(base, flags) => Some((resolve(base, PageLevel::L1, va), flags)),
            EntryKind::Empty | EntryKind::Table(..) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedPhysMemory;

    const BASE: u64 = 0x10_0000;

    fn setup(frames: usize) -> (SimulatedPhysMemory, PhysicalPage<Size4K>) {
        let mem = SimulatedPhysMemory::new(PhysicalAddress::new(BASE), frames);
        let root = PhysicalAddress::new(BASE).page();
        (mem, root)
    }

    fn vp(raw: u64) -> VirtualPage<Size4K> {
        VirtualAddress::new(raw).page()
    }

    #[test]
    fn map_creates_three_tables_then_reuses_them() {
        let (mem, root) = setup(16);
        let mut alloc = mem.frame_allocator_from(1);
        let walker = unsafe { PageTableWalker::new(root, &mem) };

        let frame = PhysicalAddress::new(BASE + 15 * 4096).page();
        let created = walker
            .map_4k(vp(0x40_0000), frame, PageFlags::user_rw(), &mut alloc)
            .unwrap();
        assert_eq!(created.pages().count(), 3);

        let again = walker
            .map_4k(vp(0x40_1000), frame, PageFlags::user_rw(), &mut alloc)
            .unwrap();
        assert!(again.is_empty());

        let (pa, flags) = walker.translate(VirtualAddress::new(0x40_1234)).unwrap();
        assert_eq!(pa, PhysicalAddress::new(BASE + 15 * 4096 + 0x234));
        assert!(flags.user() && flags.writable() && flags.no_execute());
    }

    #[test]
    fn double_map_is_rejected() {
        let (mem, root) = setup(8);
        let mut alloc = mem.frame_allocator_from(1);
        let walker = unsafe { PageTableWalker::new(root, &mem) };
        let frame = PhysicalAddress::new(BASE + 7 * 4096).page();

        walker.map_4k(vp(0x1000), frame, PageFlags::kernel_rw(), &mut alloc).unwrap();
        assert_eq!(
            walker.map_4k(vp(0x1000), frame, PageFlags::kernel_rw(), &mut alloc),
            Err(MapError::AlreadyMapped(VirtualAddress::new(0x1000)))
        );
    }

    #[test]
    fn out_of_memory_leaves_tree_untouched() {
        let (mem, root) = setup(8);
        // Room for the PDPT and PD, but not the PT.
        let mut alloc = mem.frame_allocator_from(1).with_limit(2);
        let walker = unsafe { PageTableWalker::new(root, &mem) };
        let frame = PhysicalAddress::new(BASE + 7 * 4096).page();

        let err = walker.map_4k(vp(0x20_0000), frame, PageFlags::kernel_rw(), &mut alloc);
        assert_eq!(err, Err(MapError::OutOfMemory(PageLevel::L1)));
        assert!(unsafe { mem.table_mut::<Pml4Entry>(root) }.is_empty());
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn unmap_returns_frame_and_release_unlinks() {
        let (mem, root) = setup(8);
        let mut alloc = mem.frame_allocator_from(1);
        let walker = unsafe { PageTableWalker::new(root, &mem) };
        let frame = PhysicalAddress::new(BASE + 6 * 4096).page();

        let created = walker
            .map_4k(vp(0xFFFF_8000_0000_0000), frame, PageFlags::kernel_rw(), &mut alloc)
            .unwrap();
        assert_eq!(walker.unmap_4k(vp(0xFFFF_8000_0000_0000)), Ok(frame));
        assert_eq!(
            walker.unmap_4k(vp(0xFFFF_8000_0000_0000)),
            Err(MapError::NotMapped(VirtualAddress::new(0xFFFF_8000_0000_0000)))
        );

        walker.release(vp(0xFFFF_8000_0000_0000), created, &mut alloc);
        assert!(unsafe { mem.table_mut::<Pml4Entry>(root) }.is_empty());
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn huge_leaves_translate_and_block_mapping() {
        let (mem, root) = setup(8);
        let mut alloc = mem.frame_allocator_from(1);
        let walker = unsafe { PageTableWalker::new(root, &mem) };

        // Build PML4 -> PDPT by mapping something nearby, then plant a 2 MiB leaf.
        let frame = PhysicalAddress::new(BASE + 7 * 4096).page();
        walker.map_4k(vp(0x0), frame, PageFlags::kernel_rw(), &mut alloc).unwrap();
        let pml4 = unsafe { mem.table_mut::<Pml4Entry>(root) };
        let pdpt = pml4.get(PageLevel::L4.index_of(VirtualAddress::zero())).table();
        let pd = unsafe { mem.table_mut::<PdptEntry>(pdpt) }
            .get(PageLevel::L3.index_of(VirtualAddress::zero()))
            .table();
        let huge_va = VirtualAddress::new(0x20_0000);
        unsafe { mem.table_mut::<PdEntry>(pd) }.set(
            PageLevel::L2.index_of(huge_va),
            PdEntry::new_leaf(PhysicalAddress::new(0x4000_0000), PageFlags::kernel_rw()),
        );

        let (pa, _) = walker.translate(VirtualAddress::new(0x21_2345)).unwrap();
        assert_eq!(pa, PhysicalAddress::new(0x4001_2345));
        assert_eq!(
            walker.map_4k(vp(0x20_1000), frame, PageFlags::kernel_rw(), &mut alloc),
            Err(MapError::HugePageInTheWay(VirtualAddress::new(0x20_1000)))
        );
        assert_eq!(
            walker.unmap_4k(vp(0x20_1000)),
            Err(MapError::HugePageInTheWay(VirtualAddress::new(0x20_1000)))
        );
    }

    #[test]
    fn user_leaf_widens_existing_intermediates() {
        let (mem, root) = setup(8);
        let mut alloc = mem.frame_allocator_from(1);
        let walker = unsafe { PageTableWalker::new(root, &mem) };
        let frame = PhysicalAddress::new(BASE + 7 * 4096).page();

        walker.map_4k(vp(0x1000), frame, PageFlags::kernel_rw(), &mut alloc).unwrap();
        let l4 = unsafe { mem.table_mut::<Pml4Entry>(root) }.get(PageLevel::L4.index_of(VirtualAddress::new(0x1000)));
        assert!(!l4.get(EntryFlag::User));

        walker.map_4k(vp(0x2000), frame, PageFlags::user_rw(), &mut alloc).unwrap();
        let l4 = unsafe { mem.table_mut::<Pml4Entry>(root) }.get(PageLevel::L4.index_of(VirtualAddress::new(0x2000)));
        assert!(l4.get(EntryFlag::User));
        assert!(!l4.get(EntryFlag::NoExecute));
    }

    #[test]
    fn failed_map_restores_widened_entries() {
        let (mem, root) = setup(8);
        let mut alloc = mem.frame_allocator_from(1);
        let walker = unsafe { PageTableWalker::new(root, &mem) };
        let frame = PhysicalAddress::new(BASE + 7 * 4096).page();
        walker.map_4k(vp(0x1000), frame, PageFlags::kernel_rw(), &mut alloc).unwrap();

        // Same PML4 and PDPT entries, but the next 2 MiB needs a new PT.
        let mut empty = mem.frame_allocator_from(4).with_limit(0);
        assert_eq!(
            walker.map_4k(vp(0x20_0000), frame, PageFlags::user_rw(), &mut empty),
            Err(MapError::OutOfMemory(PageLevel::L1))
        );

        let va = VirtualAddress::new(0x20_0000);
        let l4 = unsafe { mem.table_mut::<Pml4Entry>(root) }.get(PageLevel::L4.index_of(va));
        let l3 = unsafe { mem.table_mut::<PdptEntry>(l4.table()) }.get(PageLevel::L3.index_of(va));
        assert!(!l4.get(EntryFlag::User));
        assert!(!l3.get(EntryFlag::User));
        assert_eq!(walker.translate(VirtualAddress::new(0x1000)).map(|(pa, _)| pa), Some(frame.base()));
    }

    #[test]
    fn release_restores_widened_entries() {
        let (mem, root) = setup(8);
        let mut alloc = mem.frame_allocator_from(1);
        let walker = unsafe { PageTableWalker::new(root, &mem) };
        let frame = PhysicalAddress::new(BASE + 7 * 4096).page();
        walker.map_4k(vp(0x1000), frame, PageFlags::kernel_rw(), &mut alloc).unwrap();

        let created = walker.map_4k(vp(0x2000), frame, PageFlags::user_rw(), &mut alloc).unwrap();
        assert!(!created.is_empty());
        assert_eq!(created.pages().count(), 0);
        walker.unmap_4k(vp(0x2000)).unwrap();
        walker.release(vp(0x2000), created, &mut alloc);

        let va = VirtualAddress::new(0x2000);
        let l4 = unsafe { mem.table_mut::<Pml4Entry>(root) }.get(PageLevel::L4.index_of(va));
        assert!(!l4.get(EntryFlag::User));
    }
}
