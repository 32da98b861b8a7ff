//! Building the PMM from the boot memory map.

use super::{FrameBitmap, PhysicalMemoryManager, PmmError};
use kernel_info::boot::MemoryMapEntry;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};
use kernel_vmem::PhysMapper;
use log::{info, warn};

impl PhysicalMemoryManager {
    /// Register every usable entry of `entries`.
    ///
    /// Entries are trimmed to whole frames and split at `lowmem_limit`: the
    /// part below goes to the low-memory pool, the rest to the general pool.
    /// Each region keeps its bitmap in its own first frames, which are
    /// reserved right away. Entries that cannot be registered (too small,
    /// overlapping, table full) are logged and skipped.
    ///
    /// # Errors
    /// [`PmmError::OutOfMemory`] if no general-pool memory remains.
    ///
    /// # Safety
    /// - Every usable entry must describe RAM nobody else is using, reachable
    ///   through `mapper` for the rest of the kernel's lifetime.
    /// - Nothing else may hold references into that memory.
    pub unsafe fn from_memory_map<M: PhysMapper>(
        entries: &[MemoryMapEntry],
        mapper: &M,
        lowmem_limit: u64,
    ) -> Result<Self, PmmError> {
        let pmm = Self::new();
        for entry in entries.iter().filter(|e| e.is_usable()) {
            let start = entry.base.next_multiple_of(Size4K::SIZE);
            let end = entry.end() & !(Size4K::SIZE - 1);
            if start >= end {
                warn!(
                    "skipping usable entry {:#x}+{:#x}: no whole frame",
                    entry.base, entry.length
                );
                continue;
            }

            let split = lowmem_limit.clamp(start, end);
            // SAFETY: forwarded from the caller.
            unsafe {
                pmm.carve(start, split, true, mapper);
                pmm.carve(split, end, false, mapper);
            }
        }

        let (general, low) = pmm.region_count();
        if general == 0 {
            warn!("memory map holds no usable memory above {lowmem_limit:#x}");
            return Err(PmmError::OutOfMemory);
        }
        info!(
            "physical memory: {} of {} frames free in {general} regions, {} low-memory frames in {low} regions",
            pmm.free_frames(),
            pmm.total_frames(),
            pmm.lowmem_free_frames()
        );
        Ok(pmm)
    }

    /// Register `[start, end)` with its bitmap placed in its own first frames.
    unsafe fn carve<M: PhysMapper>(&self, start: u64, end: u64, low: bool, mapper: &M) {
        if start >= end {
            return;
        }
        let frames = ((end - start) / Size4K::SIZE) as usize;
        let bytes = FrameBitmap::storage_bytes(frames);
        let meta_frames = bytes.div_ceil(Size4K::SIZE as usize);
        if meta_frames >= frames {
            warn!("skipping {start:#x}..{end:#x}: too small to hold its own bitmap");
            return;
        }

        let base = PhysicalAddress::new(start);
        // SAFETY: the caller hands over this memory for the kernel's lifetime.
        let storage = unsafe { mapper.phys_to_slice(base, bytes) };
        let result = if low {
            self.add_lowmem_region(base, frames, storage)
        } else {
            self.add_region(base, frames, storage)
        };
        match result {
            Ok(()) => {
                self.reserve(base, base + meta_frames as u64 * Size4K::SIZE);
            }
            Err(e) => warn!("dropping usable memory {start:#x}..{end:#x}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryKind;
    use kernel_vmem::testing::SimulatedPhysMemory;

    const MIB: u64 = 1 << 20;

    #[test]
    fn usable_entries_are_split_at_the_lowmem_limit() {
        // 17 MiB of simulated RAM from 0; the map reports 15..17 MiB usable.
        let mem = SimulatedPhysMemory::new(PhysicalAddress::new(0), (17 * MIB / 4096) as usize);
        let map = [
            MemoryMapEntry::new(0, 0x1000, MemoryKind::Reserved),
            MemoryMapEntry::new(15 * MIB, 2 * MIB, MemoryKind::Usable),
        ];
        let pmm = unsafe { PhysicalMemoryManager::from_memory_map(&map, &mem, 16 * MIB) }.unwrap();

        assert_eq!(pmm.region_count(), (1, 1));
        // One bitmap frame is reserved in each half.
        assert_eq!(pmm.total_frames(), 256);
        assert_eq!(pmm.free_frames(), 255);
        assert_eq!(pmm.lowmem_free_frames(), 255);

        let first = pmm.allocate(0).unwrap();
        assert_eq!(first.base(), PhysicalAddress::new(16 * MIB + 0x1000));
        assert_eq!(pmm.audit(), pmm.allocated_frames());
    }

    #[test]
    fn unaligned_and_tiny_entries_are_trimmed_or_skipped() {
        let mem = SimulatedPhysMemory::new(PhysicalAddress::new(0x100_0000), 64);
        let map = [
            MemoryMapEntry::new(0x100_0800, 0x800, MemoryKind::Usable),
            MemoryMapEntry::new(0x100_1000, 0x1000, MemoryKind::Usable),
            MemoryMapEntry::new(0x100_2800, 0x3_E000, MemoryKind::Usable),
        ];
        let pmm = unsafe { PhysicalMemoryManager::from_memory_map(&map, &mem, 0) }.unwrap();
        // Only the third entry survives: [0x100_3000, 0x104_0000) is 61 frames.
        assert_eq!(pmm.region_count(), (1, 0));
        assert_eq!(pmm.total_frames(), 61);
        assert_eq!(pmm.free_frames(), 60);
    }

    #[test]
    fn overlapping_entries_keep_the_first() {
        let mem = SimulatedPhysMemory::new(PhysicalAddress::new(0x100_0000), 32);
        let map = [
            MemoryMapEntry::new(0x100_0000, 0x1_0000, MemoryKind::Usable),
            MemoryMapEntry::new(0x100_8000, 0x1_0000, MemoryKind::Usable),
        ];
        let pmm = unsafe { PhysicalMemoryManager::from_memory_map(&map, &mem, 0) }.unwrap();
        assert_eq!(pmm.region_count(), (1, 0));
        assert_eq!(pmm.total_frames(), 16);
    }

    #[test]
    fn no_general_memory_is_an_error() {
        let mem = SimulatedPhysMemory::new(PhysicalAddress::new(0), 16);
        let map = [MemoryMapEntry::new(0, 0x1_0000, MemoryKind::Usable)];
        let result = unsafe { PhysicalMemoryManager::from_memory_map(&map, &mem, 16 * MIB) };
        assert!(matches!(result, Err(PmmError::OutOfMemory)));
    }
}
