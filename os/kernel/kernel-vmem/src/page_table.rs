//! # Page Table Tree
//!
//! Bit-level model of the four x86-64 paging levels. This module is a pure
//! data layer: it knows how entries are packed and how a virtual address is
//! decomposed, but never allocates or walks.
//!
//! - [`PageLevel`] and [`TableIndex`]: VA decomposition (9 bits per level).
//! - [`EntryBits`]: the shared 64-bit hardware layout.
//! - [`Pml4Entry`], [`PdptEntry`], [`PdEntry`], [`PtEntry`]: one codec per level,
//!   all implementing [`PageEntry`].
//! - [`EntryKind`]: tagged view of an entry (`Empty | Table | Leaf`).
//! - [`PageTable<E>`]: a 4 KiB-aligned array of 512 entries.

mod entry;
mod index;
mod table;

pub use entry::{
    EntryBits, EntryFlag, EntryKind, PageEntry, PageFlags, PdEntry, PdptEntry, Pml4Entry,
    PtEntry,
};
pub use index::{PageLevel, TableIndex, join_indices, split_indices};
pub use table::{ENTRIES_PER_TABLE, PageTable, PdTable, PdptTable, Pml4Table, PtTable};
