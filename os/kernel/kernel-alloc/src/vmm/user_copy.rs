//! Copying between kernel buffers and user memory of an address space.
//!
//! Both directions hold the address-space lock from validation until the
//! last byte is copied, so a concurrent unmap cannot free a frame mid-copy.
//! Bytes move through the frames' physical addresses, so the target address
//! space does not have to be active.

use super::{Vmm, VmmError, VmmState};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{PhysMapper, TlbShootdown};

#[derive(Copy, Clone, Eq, PartialEq)]
enum Access {
    Read,
    Write,
}

impl<'c, M: PhysMapper, T: TlbShootdown> Vmm<'c, M, T> {
    /// Fill `dst` from user memory starting at `src`.
    ///
    /// # Errors
    /// - [`VmmError::InvalidRange`] if the range wraps or leaves user space.
    /// - [`VmmError::NotMapped`] at the first byte not covered by a mapped mapping.
    /// - [`VmmError::AccessViolation`] if a covering mapping is not user-readable.
    ///
    /// Nothing is copied unless the whole range is valid.
    pub fn copy_from_user(&self, src: VirtualAddress, dst: &mut [u8]) -> Result<(), VmmError> {
        let state = self.state.lock();
        self.check_user_range(&state, src, dst.len() as u64, Access::Read)?;
        let mut done = 0;
        while done < dst.len() {
            let (pa, len) = Self::user_chunk(&state, src + done as u64, dst.len() - done);
            // SAFETY: the frame belongs to a mapping of this address space and
            // the lock is held; `dst` is kernel memory, never one of its frames.
            let bytes = unsafe { self.ctx.mapper().phys_to_slice(pa, len) };
            dst[done..done + len].copy_from_slice(bytes);
            done += len;
        }
        Ok(())
    }

    /// Write `src` to user memory starting at `dst`.
    ///
    /// # Errors
    /// As for [`copy_from_user`](Self::copy_from_user), with write permission
    /// required instead of read.
    pub fn copy_to_user(&self, dst: VirtualAddress, src: &[u8]) -> Result<(), VmmError> {
        let state = self.state.lock();
        self.check_user_range(&state, dst, src.len() as u64, Access::Write)?;
        let mut done = 0;
        while done < src.len() {
            let (pa, len) = Self::user_chunk(&state, dst + done as u64, src.len() - done);
            // SAFETY: as in `copy_from_user`.
            let bytes = unsafe { self.ctx.mapper().phys_to_slice(pa, len) };
            bytes.copy_from_slice(&src[done..done + len]);
            done += len;
        }
        Ok(())
    }

    fn check_user_range(
        &self,
        state: &VmmState<'c>,
        start: VirtualAddress,
        len: u64,
        access: Access,
    ) -> Result<(), VmmError> {
        let end = start
            .checked_add(len)
            .filter(|end| end.as_u64() <= self.ctx.layout().user_end)
            .ok_or(VmmError::InvalidRange(start))?;

        let mut cursor = start;
        while cursor < end {
            let region = state
                .find(cursor)
                .filter(|r| r.mapped)
                .ok_or(VmmError::NotMapped(cursor))?;
            let flags = region.mapping.flags();
            let allowed = flags.user()
                && match access {
                    Access::Read => flags.read(),
                    Access::Write => flags.write(),
                };
            if !allowed {
                return Err(VmmError::AccessViolation(cursor));
            }
            cursor = region.mapping.end();
        }
        Ok(())
    }

    /// Physical address of `va` and how many bytes from there stay in its page,
    /// capped at `max`.
    ///
    /// `va` must lie in a range [`check_user_range`](Self::check_user_range) accepted.
    fn user_chunk(state: &VmmState<'c>, va: VirtualAddress, max: usize) -> (PhysicalAddress, usize) {
        let Some(pa) = state.find(va).and_then(|r| r.mapping.page_for(va)) else {
            panic!("{va:?} vanished from a validated range");
        };
        let in_page = (Size4K::SIZE - (va.as_u64() & (Size4K::SIZE - 1))) as usize;
        (pa, in_page.min(max))
    }
}
