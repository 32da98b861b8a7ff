//! Fixed-size object pool.

use super::{HeapAllocator, HeapArena, HeapError, HeapStats};
use core::alloc::Layout;
use core::ptr::NonNull;
use log::{debug, trace, warn};

const WORD_BITS: usize = u64::BITS as usize;

/// Slots of one object size, tracked by a bitmap at the start of the arena.
///
/// ```text
/// +-----------------+---------+--------+--------+-----
/// | occupancy words | padding | slot 0 | slot 1 | ...
/// +-----------------+---------+--------+--------+-----
/// ```
///
/// A set bit marks an occupied slot. Bits past the last slot are set from
/// the start, so a scan never hands them out.
pub struct SlabHeap {
    arena: HeapArena,
    bitmap: NonNull<u64>,
    words: usize,
    /// Offset of slot 0 in the arena.
    slots_at: usize,
    slots: usize,
    stride: usize,
    align: usize,
    used: usize,
    /// Lowest word that may have a clear bit.
    hint: usize,
}

// SAFETY: bitmap and slots live in the exclusively owned arena.
unsafe impl Send for SlabHeap {}

impl SlabHeap {
    /// Carve `arena` into slots of `object_size` bytes aligned to `align`.
    ///
    /// # Errors
    /// - [`HeapError::InvalidObject`] for a zero size or an alignment that is
    ///   not a power of two.
    /// - [`HeapError::Unaligned`] if the arena base is not 8-byte aligned.
    /// - [`HeapError::ArenaTooSmall`] if not even one slot fits.
    pub fn new(arena: HeapArena, object_size: usize, align: usize) -> Result<Self, HeapError> {
        let invalid = HeapError::InvalidObject {
            size: object_size,
            align,
        };
        if object_size == 0 || !align.is_power_of_two() {
            return Err(invalid);
        }
        if !arena.base().addr().get().is_multiple_of(align_of::<u64>()) {
            return Err(HeapError::Unaligned(align_of::<u64>()));
        }
        let stride = object_size.checked_next_multiple_of(align).ok_or(invalid)?;
        let base = arena.base().addr().get();
        let layout_for = |slots: usize| {
            let words = slots.div_ceil(WORD_BITS);
            let slots_at = (base + words * size_of::<u64>()).checked_next_multiple_of(align)? - base;
            let end = slots_at.checked_add(slots.checked_mul(stride)?)?;
            (end <= arena.len()).then_some((words, slots_at))
        };

        // Start from the estimate that ignores alignment padding, then shrink.
        let mut slots = arena.len().saturating_mul(8) / (stride * 8 + 1);
        let (words, slots_at) = loop {
            if slots == 0 {
                return Err(HeapError::ArenaTooSmall(arena.len()));
            }
            if let Some(fit) = layout_for(slots) {
                break fit;
            }
            slots -= 1;
        };

        // SAFETY: the arena is exclusively ours and the words fit before slot 0.
        #[allow(clippy::cast_ptr_alignment)]
        let bitmap = unsafe {
            let bitmap = arena.base().cast::<u64>();
            core::ptr::write_bytes(bitmap.as_ptr(), 0, words);
            bitmap
        };
        let mut heap = Self {
            arena,
            bitmap,
            words,
            slots_at,
            slots,
            stride,
            align,
            used: 0,
            hint: 0,
        };
        let tail = slots % WORD_BITS;
        if tail != 0 {
            heap.bits()[words - 1] = !0 << tail;
        }
        debug!("slab heap: {slots} slots of {stride} bytes over {:?}", heap.arena);
        Ok(heap)
    }

    /// Total slot count.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.slots
    }

    /// Bytes per slot, after rounding to the alignment.
    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.stride
    }

    fn bits(&mut self) -> &mut [u64] {
        // SAFETY: `words` words at the arena base were initialized in `new`
        // and nothing else aliases them.
        unsafe { core::slice::from_raw_parts_mut(self.bitmap.as_ptr(), self.words) }
    }
}

impl HeapAllocator for SlabHeap {
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() > self.stride || layout.align() > self.align {
            warn!("slab heap of {}-byte objects cannot serve {layout:?}", self.stride);
            return None;
        }
        let (hint, words) = (self.hint, self.words);
        let bits = self.bits();
        let Some(word) = (hint..words).find(|&w| bits[w] != u64::MAX) else {
            warn!("slab heap exhausted: {} slots in use", self.used);
            return None;
        };
        let bit = bits[word].trailing_ones() as usize;
        bits[word] |= 1 << bit;
        self.hint = word;
        self.used += 1;

        let slot = word * WORD_BITS + bit;
        trace!("slab heap: slot {slot}");
        // SAFETY: `slot < slots`, so the slot lies inside the arena.
        NonNull::new(unsafe { self.arena.at(self.slots_at + slot * self.stride) })
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        let slot = self
            .arena
            .offset_of(ptr.as_ptr())
            .and_then(|off| off.checked_sub(self.slots_at))
            .filter(|off| off % self.stride == 0)
            .map(|off| off / self.stride)
            .filter(|&slot| slot < self.slots);
        let Some(slot) = slot else {
            panic!("free of {ptr:p}, which is not a slot of this slab heap");
        };

        let (word, mask) = (slot / WORD_BITS, 1u64 << (slot % WORD_BITS));
        let bits = self.bits();
        assert!(bits[word] & mask != 0, "double free of slab slot {slot}");
        bits[word] &= !mask;
        self.used -= 1;
        self.hint = self.hint.min(word);
        trace!("slab heap: freed slot {slot}");
    }

    fn stats(&self) -> HeapStats {
        HeapStats {
            capacity: self.slots * self.stride,
            used: self.used * self.stride,
            allocations: self.used,
        }
    }
}

impl core::fmt::Debug for SlabHeap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlabHeap")
            .field("arena", &self.arena)
            .field("stride", &self.stride)
            .field("slots", &self.slots)
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}
