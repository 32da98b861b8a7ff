//! A contiguous run of usable physical memory and its bitmap.

use super::{FrameBitmap, PhysicalFrame};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};

pub struct PhysicalRegion {
    base: PhysicalPage<Size4K>,
    bitmap: FrameBitmap<'static>,
}

impl PhysicalRegion {
    #[must_use]
    pub const fn new(base: PhysicalPage<Size4K>, bitmap: FrameBitmap<'static>) -> Self {
        Self { base, bitmap }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base.base()
    }

    /// First address past the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.base().as_u64() + self.frames() as u64 * Size4K::SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.bitmap.len()
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.bitmap.free_count()
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.base().as_u64() && pa.as_u64() < self.end().as_u64()
    }

    /// `true` if `[start, end)` shares at least one byte with this region.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, start: PhysicalAddress, end: PhysicalAddress) -> bool {
        start.as_u64() < self.end().as_u64() && self.base().as_u64() < end.as_u64()
    }

    #[must_use]
    pub fn bitmap(&self) -> &FrameBitmap<'static> {
        &self.bitmap
    }

    fn index_of(&self, pa: PhysicalAddress) -> usize {
        ((pa.as_u64() - self.base().as_u64()) >> Size4K::SHIFT) as usize
    }

    /// Allocate `2^order` frames aligned to `2^order` frame numbers.
    pub fn allocate(&mut self, order: u8) -> Option<PhysicalFrame> {
        let count = 1usize << order;
        let idx = self
            .bitmap
            .allocate_aligned(count, count, self.base.number() as usize)?;
        Some(PhysicalFrame::new(
            PhysicalPage::from_number(self.base.number() + idx as u64),
            order,
        ))
    }

    /// # Panics
    /// If `frame` is not wholly inside the region, or any of its frames is free.
    pub fn free(&mut self, frame: PhysicalFrame) {
        assert!(
            self.contains(frame.base()) && frame.end().as_u64() <= self.end().as_u64(),
            "{frame:?} is not inside region {}..{}",
            self.base(),
            self.end()
        );
        let idx = self.index_of(frame.base());
        self.bitmap.free(idx, frame.pages());
    }

    /// Mark every frame overlapping `[start, end)` allocated.
    ///
    /// Returns the number of frames that were free before.
    pub fn reserve(&mut self, start: PhysicalAddress, end: PhysicalAddress) -> usize {
        let lo = start.as_u64().max(self.base().as_u64());
        let hi = end.as_u64().min(self.end().as_u64());
        if lo >= hi {
            return 0;
        }
        let first = self.index_of(PhysicalAddress::new(lo));
        let last = self.index_of(PhysicalAddress::new(hi - 1));
        self.bitmap.reserve(first, last - first + 1)
    }
}

impl core::fmt::Debug for PhysicalRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysicalRegion")
            .field("base", &self.base())
            .field("end", &self.end())
            .field("free", &self.free_frames())
            .finish()
    }
}
