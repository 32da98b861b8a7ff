//! TLB maintenance across cores.
//!
//! After a leaf is cleared or changed, every core that may cache the old
//! translation has to invalidate it before the frame is reused. The address
//! space manager tracks which CPUs have an address space loaded in a
//! [`CpuMask`]; a [`TlbShootdown`] implementation flushes the local TLB and
//! interrupts the other cores in that mask.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualPage};

/// Logical CPU number, `0..64`.
pub type CpuId = u32;

/// A set of up to 64 CPUs.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const EMPTY: Self = Self(0);

    /// Highest supported CPU count.
    pub const CAPACITY: u32 = 64;

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn single(cpu: CpuId) -> Self {
        Self::EMPTY.with(cpu)
    }

    #[inline]
    #[must_use]
    pub const fn with(self, cpu: CpuId) -> Self {
        debug_assert!(cpu < Self::CAPACITY);
        Self(self.0 | (1 << cpu))
    }

    #[inline]
    #[must_use]
    pub const fn without(self, cpu: CpuId) -> Self {
        debug_assert!(cpu < Self::CAPACITY);
        Self(self.0 & !(1 << cpu))
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu < Self::CAPACITY && self.0 & (1 << cpu) != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Member CPUs in ascending order.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut rest = self.0;
        core::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let cpu = rest.trailing_zeros();
            rest &= rest - 1;
            Some(cpu)
        })
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A [`CpuMask`] that can be updated concurrently.
#[derive(Debug, Default)]
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn insert(&self, cpu: CpuId) {
        self.0.fetch_or(CpuMask::single(cpu).bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn remove(&self, cpu: CpuId) {
        self.0.fetch_and(!CpuMask::single(cpu).bits(), Ordering::AcqRel);
    }

    #[inline]
    #[must_use]
    pub fn load(&self) -> CpuMask {
        CpuMask(self.0.load(Ordering::Acquire))
    }
}

/// Invalidation of cached translations on the current and on remote cores.
pub trait TlbShootdown: Sync {
    /// The CPU this code is running on.
    fn current_cpu(&self) -> CpuId;

    /// Invalidate `page` in the current core's TLB.
    fn flush_local(&self, page: VirtualPage<Size4K>);

    /// Invalidate `pages` on every CPU in `targets`.
    ///
    /// Must not return before all targets have performed the invalidation.
    /// `targets` never contains the current CPU.
    fn flush_remote(&self, targets: CpuMask, pages: &[VirtualPage<Size4K>]);
}

/// Shootdown for a single-core system: only the local TLB exists.
#[derive(Debug, Default, Copy, Clone)]
pub struct LocalTlb;

impl TlbShootdown for LocalTlb {
    fn current_cpu(&self) -> CpuId {
        0
    }

    fn flush_local(&self, page: VirtualPage<Size4K>) {
        invalidate_page(page);
    }

    fn flush_remote(&self, targets: CpuMask, _pages: &[VirtualPage<Size4K>]) {
        assert!(
            targets.is_empty(),
            "remote TLB flush for {targets:?} on a single-core system"
        );
    }
}

/// Invalidate the TLB entry for `page` on the current core (`invlpg`).
#[inline]
pub fn invalidate_page(page: VirtualPage<Size4K>) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) page.base().as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = page;
}

/// Load `root` into CR3, switching the current core to that address space.
///
/// # Safety
/// `root` must be a complete PML4 that maps the currently executing code,
/// stack and data at the same addresses.
#[inline]
pub unsafe fn load_root(root: PhysicalPage<Size4K>) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root.base().as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = root;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_set_operations() {
        let m = CpuMask::EMPTY.with(0).with(3).with(63);
        assert_eq!(m.count(), 3);
        assert!(m.contains(3) && !m.contains(4));
        assert!(!m.contains(64));
        assert_eq!(m.without(3).iter().collect::<Vec<_>>(), [0, 63]);
        assert!(CpuMask::EMPTY.is_empty());
    }

    #[test]
    fn atomic_mask_tracks_membership() {
        let m = AtomicCpuMask::new();
        m.insert(1);
        m.insert(2);
        m.remove(1);
        assert_eq!(m.load(), CpuMask::single(2));
    }

    #[test]
    #[should_panic(expected = "single-core")]
    fn local_tlb_rejects_remote_targets() {
        LocalTlb.flush_remote(CpuMask::single(1), &[]);
    }
}
