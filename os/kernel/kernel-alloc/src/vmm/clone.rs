//! Duplicating an address space.
//!
//! The parent's tree is walked under its lock. Shared-window L4 entries are
//! copied as they are; every other table is copied into a fresh frame and
//! its present entries are rewritten to point at the child's copies:
//!
//! - L3/L2 entries with `PS=1` are copied by value; the huge frame ends up
//!   shared between parent and child.
//! - L1 leaves inside a [`Sharing::Private`] mapping point at the child's
//!   duplicate of that mapping; inside a [`Sharing::Shared`] mapping they keep
//!   the parent's frame.
//! - L1 leaves not covered by any mapping get a private copy of their frame.

use super::{Region, Vmm, VmmError, VmmState};
use crate::mapping::Sharing;
use crate::pmm::PhysicalMemoryManager;
use alloc::sync::Arc;
use core::ops::Range;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::page_table::{
    ENTRIES_PER_TABLE, EntryBits, EntryKind, PageLevel, Pml4Entry, TableIndex, join_indices,
};
use kernel_vmem::{PageEntry, PhysMapper, TlbShootdown};
use log::{debug, trace, warn};

impl<'c, M: PhysMapper, T: TlbShootdown> Vmm<'c, M, T> {
    /// Create a child address space holding a copy of this one.
    ///
    /// The parent stays locked for the whole walk. The child is always a
    /// user address space; it starts inactive. Mappings inside the shared
    /// window stay with the kernel address space: the child sees them
    /// through the window but does not own them.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] or [`VmmError::Mapping`] if frames run out.
    /// Everything allocated for the child so far is released.
    pub fn try_clone(&self) -> Result<Self, VmmError> {
        let parent = self.state.lock();
        let mut child = Self::with_root(self.ctx, false)?;
        let child_root = child.root;
        let state = child.state.get_mut();

        let layout = self.ctx.layout();
        let owned = parent
            .regions
            .iter()
            .filter(|r| !layout.in_kernel_window(r.mapping.start()));
        for region in owned {
            let mapping = match region.mapping.sharing() {
                Sharing::Shared => Arc::clone(&region.mapping),
                Sharing::Private => Arc::new(region.mapping.duplicate(self.ctx.mapper())?),
            };
            state.regions.push(Region {
                mapping,
                mapped: region.mapped,
            });
        }
        state.next_kernel_stack = parent.next_kernel_stack;

        let mut cloner = TreeCloner {
            pmm: self.ctx.pmm(),
            mapper: self.ctx.mapper(),
            window: self.ctx.layout().kernel_window_slots(),
            child: state,
            tables: 0,
            orphans: 0,
        };
        cloner.clone_root(self.root, child_root)?;
        debug!(
            "cloned {} into {child_root}: {} mappings, {} tables, {} unbacked pages copied",
            self.root,
            cloner.child.regions.len(),
            cloner.tables,
            cloner.orphans
        );
        drop(parent);
        Ok(child)
    }
}

/// Position of a level's index in a `[L4, L3, L2, L1]` array.
const fn depth(level: PageLevel) -> usize {
    match level {
        PageLevel::L4 => 0,
        PageLevel::L3 => 1,
        PageLevel::L2 => 2,
        PageLevel::L1 => 3,
    }
}

/// `raw` with its address field replaced by `page`.
fn relink(raw: u64, page: PhysicalPage<Size4K>) -> u64 {
    let mut bits = EntryBits::from_bits(raw);
    bits.set_address(page.base());
    bits.into_bits()
}

struct TreeCloner<'a, 'c, M: PhysMapper> {
    pmm: &'c PhysicalMemoryManager,
    mapper: &'c M,
    window: Range<usize>,
    child: &'a mut VmmState<'c>,
    tables: usize,
    orphans: usize,
}

impl<M: PhysMapper> TreeCloner<'_, '_, M> {
    fn raw<'t>(&self, page: PhysicalPage<Size4K>) -> &'t mut [u64; ENTRIES_PER_TABLE] {
        // SAFETY: every page passed here is a table frame of the locked parent
        // or a frame just allocated for the child; all are distinct.
        unsafe { self.mapper.phys_to_mut(page.base()) }
    }

    fn alloc_frame(&mut self) -> Result<PhysicalPage<Size4K>, VmmError> {
        let Ok(frame) = self.pmm.allocate(0) else {
            warn!("out of memory while cloning an address space");
            return Err(VmmError::OutOfMemory);
        };
        self.child.internal.push(frame.page());
        Ok(frame.page())
    }

    fn clone_root(
        &mut self,
        parent: PhysicalPage<Size4K>,
        child: PhysicalPage<Size4K>,
    ) -> Result<(), VmmError> {
        let src = self.raw(parent);
        let dst = self.raw(child);
        for slot in 0..ENTRIES_PER_TABLE {
            let idx = TableIndex::new(slot as u16);
            match Pml4Entry::from_raw(src[slot]).kind() {
                EntryKind::Empty => {}
                EntryKind::Table(..) if self.window.contains(&slot) => dst[slot] = src[slot],
                EntryKind::Table(next, _) => {
                    let indices = [idx, TableIndex::new(0), TableIndex::new(0), TableIndex::new(0)];
                    let copy = self.clone_table(PageLevel::L3, next, indices)?;
                    dst[slot] = relink(src[slot], copy);
                }
                EntryKind::Leaf(..) => unreachable!("PML4 entries never decode as leaves"),
            }
        }
        Ok(())
    }

    /// Copy the `level` table at `parent` and everything below it.
    ///
    /// `indices` locates the table: entries above `level` are filled in.
    fn clone_table(
        &mut self,
        level: PageLevel,
        parent: PhysicalPage<Size4K>,
        indices: [TableIndex; 4],
    ) -> Result<PhysicalPage<Size4K>, VmmError> {
        let copy = self.alloc_frame()?;
        self.tables += 1;
        let src = self.raw(parent);
        let dst = self.raw(copy);
        dst.copy_from_slice(src);

        for (i, &raw) in src.iter().enumerate() {
            let bits = EntryBits::from_bits(raw);
            if !bits.present() {
                continue;
            }
            let mut at = indices;
            at[depth(level)] = TableIndex::new(i as u16);

            match level.next_lower() {
                Some(_) if bits.size_or_pat() => {
                    trace!("sharing {level:?} huge leaf at {:?}", join_indices(at));
                }
                Some(lower) => {
                    let sub = self.clone_table(lower, bits.address().page(), at)?;
                    dst[i] = relink(raw, sub);
                }
                None => {
                    let frame = self.leaf_frame(join_indices(at), bits.address())?;
                    dst[i] = relink(raw, frame);
                }
            }
        }
        Ok(copy)
    }

    /// The child's frame for the 4 KiB page at `va`, which the parent maps to `parent`.
    fn leaf_frame(
        &mut self,
        va: VirtualAddress,
        parent: PhysicalAddress,
    ) -> Result<PhysicalPage<Size4K>, VmmError> {
        if let Some(pa) = self.child.find(va).and_then(|r| r.mapping.page_for(va)) {
            return Ok(pa.page());
        }

        let copy = self.alloc_frame()?;
        self.orphans += 1;
        // SAFETY: distinct frames, both reachable through the mapper.
        unsafe {
            self.mapper
                .frame_bytes(copy)
                .copy_from_slice(self.mapper.frame_bytes(parent.page()));
        }
        Ok(copy)
    }
}
