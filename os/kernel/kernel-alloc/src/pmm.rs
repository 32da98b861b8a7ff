//! # Physical Memory Manager
//!
//! Tracks every usable 4 KiB frame with one bit in a per-region
//! [`FrameBitmap`]. Regions are kept sorted by base address and scanned
//! lowest first, so allocations prefer low frames.
//!
//! Frames below the low-memory limit (16 MiB by default) live in a separate
//! pool that only [`PhysicalMemoryManager::allocate_lowmem`] draws from, so
//! legacy DMA buffers are not starved by ordinary allocations.
//!
//! All state sits behind an [`IrqSpinLock`]: the allocator can be entered from
//! interrupt context on any CPU.

mod bitmap;
mod boot;
mod region;

pub use bitmap::FrameBitmap;
pub use region::PhysicalRegion;

use core::fmt;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::IrqSpinLock;
use kernel_vmem::FrameAlloc;

/// Capacity of the general region table.
pub const MAX_REGIONS: usize = 32;

/// Capacity of the low-memory region table.
pub const MAX_LOWMEM_REGIONS: usize = 8;

/// Largest supported allocation order (`2^10` frames, 4 MiB).
pub const MAX_ORDER: u8 = 10;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PmmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("region {0}..{1} overlaps a registered region")]
    RegionOverlap(PhysicalAddress, PhysicalAddress),
    #[error("region table is full")]
    TooManyRegions,
    #[error("bitmap storage is too small for the region")]
    BitmapTooSmall,
    #[error("invalid region: {0}")]
    InvalidRegion(&'static str),
    #[error("order {0} exceeds the supported maximum")]
    OrderTooLarge(u8),
}

/// `2^order` physically contiguous frames, aligned to their own size.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PhysicalFrame {
    page: PhysicalPage<Size4K>,
    order: u8,
}

impl PhysicalFrame {
    #[inline]
    #[must_use]
    pub const fn new(page: PhysicalPage<Size4K>, order: u8) -> Self {
        Self { page, order }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.page.base()
    }

    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage<Size4K> {
        self.page
    }

    #[inline]
    #[must_use]
    pub const fn order(self) -> u8 {
        self.order
    }

    /// Number of 4 KiB frames.
    #[inline]
    #[must_use]
    pub const fn pages(self) -> usize {
        1 << self.order
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(self) -> u64 {
        Size4K::SIZE << self.order
    }

    #[inline]
    #[must_use]
    pub const fn end(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base().as_u64() + self.size())
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.base().as_u64() && pa.as_u64() < self.end().as_u64()
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalFrame({}..{}, order {})", self.base(), self.end(), self.order)
    }
}

/// Fixed-capacity table of regions sorted by base address.
struct RegionTable<const N: usize> {
    slots: [Option<PhysicalRegion>; N],
    len: usize,
}

impl<const N: usize> RegionTable<N> {
    const fn new() -> Self {
        Self {
            slots: [const { None }; N],
            len: 0,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &PhysicalRegion> {
        self.slots[..self.len].iter().flatten()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut PhysicalRegion> {
        self.slots[..self.len].iter_mut().flatten()
    }

    fn find_mut(&mut self, pa: PhysicalAddress) -> Option<&mut PhysicalRegion> {
        self.iter_mut().find(|r| r.contains(pa))
    }

    fn insert(&mut self, region: PhysicalRegion) -> Result<(), PmmError> {
        if self.len == N {
            return Err(PmmError::TooManyRegions);
        }
        let pos = self
            .iter()
            .take_while(|r| r.base().as_u64() < region.base().as_u64())
            .count();
        // slots[len] is None; rotating moves it to `pos`.
        self.slots[pos..=self.len].rotate_right(1);
        self.slots[pos] = Some(region);
        self.len += 1;
        Ok(())
    }
}

struct PmmState {
    general: RegionTable<MAX_REGIONS>,
    low: RegionTable<MAX_LOWMEM_REGIONS>,
}

impl PmmState {
    fn regions(&self) -> impl Iterator<Item = &PhysicalRegion> {
        self.general.iter().chain(self.low.iter())
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum Pool {
    General,
    Low,
}

/// The system's physical frame allocator.
pub struct PhysicalMemoryManager {
    state: IrqSpinLock<PmmState>,
}

impl PhysicalMemoryManager {
    /// A manager with no regions; every allocation fails until regions are added.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: IrqSpinLock::new(PmmState {
                general: RegionTable::new(),
                low: RegionTable::new(),
            }),
        }
    }

    /// Register `frames` frames starting at `base` in the general pool.
    ///
    /// `bitmap` becomes the region's tracking storage; it is zeroed here.
    ///
    /// # Errors
    /// - [`PmmError::InvalidRegion`] for an unaligned or empty region.
    /// - [`PmmError::RegionOverlap`] if any registered region shares a frame.
    /// - [`PmmError::BitmapTooSmall`] if `bitmap` cannot hold `frames` bits.
    /// - [`PmmError::TooManyRegions`] if the region table is full.
    pub fn add_region(
        &self,
        base: PhysicalAddress,
        frames: usize,
        bitmap: &'static mut [u8],
    ) -> Result<(), PmmError> {
        self.register(Pool::General, base, frames, bitmap)
    }

    /// Register a region in the low-memory pool.
    ///
    /// # Errors
    /// As for [`add_region`](Self::add_region).
    pub fn add_lowmem_region(
        &self,
        base: PhysicalAddress,
        frames: usize,
        bitmap: &'static mut [u8],
    ) -> Result<(), PmmError> {
        self.register(Pool::Low, base, frames, bitmap)
    }

    fn register(
        &self,
        pool: Pool,
        base: PhysicalAddress,
        frames: usize,
        bitmap: &'static mut [u8],
    ) -> Result<(), PmmError> {
        if !base.is_aligned_to(Size4K::SIZE) {
            return Err(PmmError::InvalidRegion("base is not page aligned"));
        }
        if frames == 0 {
            return Err(PmmError::InvalidRegion("region has no frames"));
        }
        let end = (frames as u64)
            .checked_mul(Size4K::SIZE)
            .and_then(|len| base.checked_add(len))
            .ok_or(PmmError::InvalidRegion("region wraps the address space"))?;

        let mut state = self.state.lock();
        if state.regions().any(|r| r.overlaps(base, end)) {
            log::warn!("rejecting physical region {base}..{end}: overlaps a registered region");
            return Err(PmmError::RegionOverlap(base, end));
        }

        let region = PhysicalRegion::new(base.page(), FrameBitmap::new(bitmap, frames)?);
        match pool {
            Pool::General => state.general.insert(region)?,
            Pool::Low => state.low.insert(region)?,
        }
        log::info!(
            "registered {} physical region {base}..{end} ({frames} frames)",
            if pool == Pool::Low { "low-memory" } else { "general" }
        );
        Ok(())
    }

    /// Allocate `2^order` contiguous frames aligned to `2^order` frames.
    ///
    /// # Errors
    /// [`PmmError::OutOfMemory`] if no region has a suitable free run, or
    /// [`PmmError::OrderTooLarge`] above [`MAX_ORDER`].
    pub fn allocate(&self, order: u8) -> Result<PhysicalFrame, PmmError> {
        Self::allocate_from(&mut self.state.lock().general.iter_mut(), order)
    }

    /// As [`allocate`](Self::allocate), from the low-memory pool only.
    ///
    /// # Errors
    /// As for [`allocate`](Self::allocate).
    pub fn allocate_lowmem(&self, order: u8) -> Result<PhysicalFrame, PmmError> {
        Self::allocate_from(&mut self.state.lock().low.iter_mut(), order)
    }

    fn allocate_from<'r>(
        regions: &mut impl Iterator<Item = &'r mut PhysicalRegion>,
        order: u8,
    ) -> Result<PhysicalFrame, PmmError> {
        if order > MAX_ORDER {
            return Err(PmmError::OrderTooLarge(order));
        }
        let frame = regions
            .find_map(|r| r.allocate(order))
            .ok_or(PmmError::OutOfMemory)?;
        log::trace!("allocated {frame:?}");
        Ok(frame)
    }

    /// Return frames obtained from [`allocate`](Self::allocate).
    ///
    /// # Panics
    /// If no general region owns `frame`, or it is already free. Either means
    /// kernel state is corrupt.
    pub fn free(&self, frame: PhysicalFrame) {
        let mut state = self.state.lock();
        let Some(region) = state.general.find_mut(frame.base()) else {
            panic!("free of {frame:?}: no physical region owns it");
        };
        region.free(frame);
        log::trace!("freed {frame:?}");
    }

    /// Return frames obtained from [`allocate_lowmem`](Self::allocate_lowmem).
    ///
    /// # Panics
    /// As for [`free`](Self::free), against the low-memory pool.
    pub fn free_lowmem(&self, frame: PhysicalFrame) {
        let mut state = self.state.lock();
        let Some(region) = state.low.find_mut(frame.base()) else {
            panic!("free of {frame:?}: no low-memory region owns it");
        };
        region.free(frame);
    }

    /// Mark all frames overlapping `[start, end)` as allocated, in both pools.
    ///
    /// Used for boot data that lives in memory reported as usable. Returns the
    /// number of frames that were free before.
    pub fn reserve(&self, start: PhysicalAddress, end: PhysicalAddress) -> usize {
        let mut state = self.state.lock();
        let general: usize = state.general.iter_mut().map(|r| r.reserve(start, end)).sum();
        let low: usize = state.low.iter_mut().map(|r| r.reserve(start, end)).sum();
        general + low
    }

    /// `true` if a region of either pool covers `pa`.
    #[must_use]
    pub fn owns(&self, pa: PhysicalAddress) -> bool {
        self.state.lock().regions().any(|r| r.contains(pa))
    }

    /// Free frames in the general pool.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.state.lock().general.iter().map(PhysicalRegion::free_frames).sum()
    }

    /// Free frames in the low-memory pool.
    #[must_use]
    pub fn lowmem_free_frames(&self) -> usize {
        self.state.lock().low.iter().map(PhysicalRegion::free_frames).sum()
    }

    /// Frames managed by the general pool.
    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.state.lock().general.iter().map(PhysicalRegion::frames).sum()
    }

    /// Allocated (or reserved) frames across both pools.
    #[must_use]
    pub fn allocated_frames(&self) -> usize {
        self.state
            .lock()
            .regions()
            .map(|r| r.frames() - r.free_frames())
            .sum()
    }

    /// Recount allocated frames from the bitmaps themselves.
    ///
    /// Always equal to [`allocated_frames`](Self::allocated_frames) unless
    /// the bookkeeping is broken.
    #[must_use]
    pub fn audit(&self) -> usize {
        self.state.lock().regions().map(|r| r.bitmap().count_set()).sum()
    }

    /// Number of registered regions in (general, low-memory) pools.
    #[must_use]
    pub fn region_count(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.general.len, state.low.len)
    }
}

impl Default for PhysicalMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PhysicalMemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalMemoryManager")
            .field("free_frames", &self.free_frames())
            .field("total_frames", &self.total_frames())
            .finish_non_exhaustive()
    }
}

/// Page-table frames come straight from the general pool.
impl FrameAlloc for &PhysicalMemoryManager {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate(0).ok().map(PhysicalFrame::page)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.free(PhysicalFrame::new(page, 0));
    }
}
