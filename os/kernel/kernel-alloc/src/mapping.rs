//! # Virtual Mappings
//!
//! A [`Mapping`] is a page-aligned virtual range together with the physical
//! frames that back it. It owns those frames: they are allocated when the
//! mapping is created and returned to the PMM when the last reference drops.
//!
//! Mappings are bookkeeping only. Installing them into page tables is the
//! job of [`Vmm::map`](crate::vmm::Vmm::map).

use crate::pmm::{PhysicalFrame, PhysicalMemoryManager, PmmError};
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage,
};
use kernel_vmem::{PageFlags, PhysMapper};

/// Access rights of a mapping.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct MappingFlags {
    /// Accessible from ring 3.
    pub user: bool,
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    #[bits(4)]
    __reserved: u8,
}

impl MappingFlags {
    /// Kernel data.
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_read(true).with_write(true)
    }

    /// User data.
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::kernel_rw().with_user(true)
    }

    /// User code.
    #[must_use]
    pub const fn user_rx() -> Self {
        Self::new().with_user(true).with_read(true).with_exec(true)
    }

    /// Leaf flags implementing these rights.
    ///
    /// x86-64 cannot express write-only or execute-only pages; any of the
    /// three rights makes the page readable.
    #[must_use]
    pub const fn page_flags(self) -> PageFlags {
        PageFlags::new()
            .with_user(self.user())
            .with_writable(self.write())
            .with_no_execute(!self.exec())
    }
}

/// What happens to a mapping when its address space is cloned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Sharing {
    /// The clone gets its own frames holding a copy of the data.
    Private,
    /// The clone references the same mapping and frames.
    Shared,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MappingError {
    #[error("mapping has zero size")]
    ZeroSized,
    #[error("mapping start or size is not page aligned")]
    Unaligned,
    #[error("mapping wraps the address space")]
    AddressOverflow,
    #[error("out of physical memory while backing the mapping")]
    OutOfMemory,
}

impl From<PmmError> for MappingError {
    fn from(_: PmmError) -> Self {
        Self::OutOfMemory
    }
}

/// A page-aligned virtual range `[start, start + size)` and its frames.
pub struct Mapping<'p> {
    start: VirtualAddress,
    size: u64,
    flags: MappingFlags,
    sharing: Sharing,
    /// Frames in virtual order; their sizes sum to `size`.
    frames: Vec<PhysicalFrame>,
    pmm: &'p PhysicalMemoryManager,
}

impl<'p> Mapping<'p> {
    /// Reserve frames for `size` bytes at `start`.
    ///
    /// The frames' contents are not cleared.
    ///
    /// # Errors
    /// - [`MappingError::ZeroSized`] / [`MappingError::Unaligned`] /
    ///   [`MappingError::AddressOverflow`] for a bad range.
    /// - [`MappingError::OutOfMemory`] if the PMM runs dry; frames taken so
    ///   far are returned first.
    pub fn create(
        pmm: &'p PhysicalMemoryManager,
        start: VirtualAddress,
        size: u64,
        flags: MappingFlags,
        sharing: Sharing,
    ) -> Result<Self, MappingError> {
        if size == 0 {
            return Err(MappingError::ZeroSized);
        }
        if !start.is_aligned_to(Size4K::SIZE) || !size.is_multiple_of(Size4K::SIZE) {
            return Err(MappingError::Unaligned);
        }
        start.checked_add(size).ok_or(MappingError::AddressOverflow)?;

        let pages = (size / Size4K::SIZE) as usize;
        let mut mapping = Self {
            start,
            size,
            flags,
            sharing,
            frames: Vec::with_capacity(pages),
            pmm,
        };
        for _ in 0..pages {
            match pmm.allocate(0) {
                Ok(frame) => mapping.frames.push(frame),
                Err(e) => {
                    log::warn!(
                        "cannot back {pages} pages at {start:?}: {e} after {} frames",
                        mapping.frames.len()
                    );
                    // Dropping `mapping` returns the frames taken so far.
                    return Err(e.into());
                }
            }
        }
        log::trace!("created mapping {mapping:?}");
        Ok(mapping)
    }

    /// A new mapping over the same range with its own frames, holding a copy
    /// of this mapping's data.
    ///
    /// # Errors
    /// [`MappingError::OutOfMemory`] if the new frames cannot be allocated.
    pub fn duplicate<M: PhysMapper>(&self, mapper: &M) -> Result<Self, MappingError> {
        let copy = Self::create(self.pmm, self.start, self.size, self.flags, self.sharing)?;
        for (src, dst) in self.frames.iter().zip(&copy.frames) {
            let len = src.size() as usize;
            // SAFETY: both frames are owned by live mappings and reachable
            // through `mapper`; they are distinct, so the slices don't alias.
            unsafe {
                mapper
                    .phys_to_slice(dst.base(), len)
                    .copy_from_slice(mapper.phys_to_slice(src.base(), len));
            }
        }
        Ok(copy)
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// First address past the mapping.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + self.size)
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> MappingFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn sharing(&self) -> Sharing {
        self.sharing
    }

    #[inline]
    #[must_use]
    pub fn frames(&self) -> &[PhysicalFrame] {
        &self.frames
    }

    /// Number of 4 KiB pages covered.
    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> usize {
        (self.size / Size4K::SIZE) as usize
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end().as_u64()
    }

    /// `true` if `[start, end)` shares at least one byte with this mapping.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        start.as_u64() < self.end().as_u64() && self.start.as_u64() < end.as_u64()
    }

    /// Every 4 KiB page of the mapping with the frame backing it, in address order.
    pub fn pages(&self) -> impl Iterator<Item = (VirtualPage<Size4K>, PhysicalPage<Size4K>)> + '_ {
        self.frames
            .iter()
            .flat_map(|f| (0..f.pages() as u64).map(move |k| PhysicalPage::from_number(f.page().number() + k)))
            .enumerate()
            .map(|(i, frame)| {
                let page = VirtualPage::containing_address(self.start + i as u64 * Size4K::SIZE);
                (page, frame)
            })
    }

    /// Physical address backing `va`, or `None` outside the mapping.
    ///
    /// # Panics
    /// If the frame list does not cover the mapping's size.
    #[must_use]
    pub fn page_for(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let offset = va.checked_offset_from(self.start).filter(|&o| o < self.size)?;
        let mut covered = 0;
        for frame in &self.frames {
            if offset < covered + frame.size() {
                return Some(frame.base() + (offset - covered));
            }
            covered += frame.size();
        }
        panic!(
            "mapping at {:?}: frames cover {covered:#x} of {:#x} bytes",
            self.start, self.size
        );
    }
}

impl Drop for Mapping<'_> {
    fn drop(&mut self) {
        for frame in self.frames.drain(..) {
            self.pmm.free(frame);
        }
    }
}

impl fmt::Debug for Mapping<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("start", &self.start)
            .field("end", &self.end())
            .field("flags", &self.flags)
            .field("sharing", &self.sharing)
            .field("frames", &self.frames.len())
            .finish_non_exhaustive()
    }
}
