use crate::PhysMapper;
use kernel_memory_addresses::PhysicalAddress;

/// [`PhysMapper`] for kernels with a higher-half direct map (HHDM).
///
/// Every physical address `pa` is reachable at `base + pa`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmMapper {
    base: u64,
}

impl HhdmMapper {
    /// Mapper over the default direct map at [`HHDM_BASE`](kernel_info::memory::HHDM_BASE).
    pub const DEFAULT: Self = Self::new(kernel_info::memory::HHDM_BASE);

    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self { base }
    }
}

impl Default for HhdmMapper {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// SAFETY: the boot stage maps all physical RAM read/write at `base`.
unsafe impl PhysMapper for HhdmMapper {
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (self.base + pa.as_u64()) as usize as *mut u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_addresses_are_offset_by_the_base() {
        let m = HhdmMapper::new(0xffff_8800_0000_0000);
        let ptr = unsafe { m.phys_to_ptr(PhysicalAddress::new(0x1234_5000)) };
        assert_eq!(ptr.addr(), 0xffff_8800_1234_5000);
        assert_eq!(HhdmMapper::default(), HhdmMapper::DEFAULT);
    }
}
