//! One bit per frame; a set bit means allocated.

use super::PmmError;

/// Free/used tracking for the frames of one region.
///
/// Bits past `entries` in the last storage bytes are padding and stay set so
/// they can never be handed out.
pub struct FrameBitmap<'a> {
    bits: &'a mut [u8],
    entries: usize,
    free: usize,
}

impl<'a> FrameBitmap<'a> {
    /// Bytes of storage needed to track `entries` frames.
    #[inline]
    #[must_use]
    pub const fn storage_bytes(entries: usize) -> usize {
        entries.div_ceil(8)
    }

    /// Build an all-free bitmap for `entries` frames on top of `storage`.
    ///
    /// # Errors
    /// [`PmmError::BitmapTooSmall`] if `storage` holds fewer than `entries` bits.
    pub fn new(storage: &'a mut [u8], entries: usize) -> Result<Self, PmmError> {
        if storage.len() < Self::storage_bytes(entries) {
            return Err(PmmError::BitmapTooSmall);
        }
        storage.fill(0);
        for pad in entries..storage.len() * 8 {
            storage[pad / 8] |= 1 << (pad % 8);
        }
        Ok(Self {
            bits: storage,
            entries,
            free: entries,
        })
    }

    /// Number of frames tracked (padding excluded).
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries == 0
    }

    #[inline]
    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free
    }

    #[inline]
    #[must_use]
    pub fn is_set(&self, idx: usize) -> bool {
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    /// Count set bits by scanning the storage, padding excluded.
    #[must_use]
    pub fn count_set(&self) -> usize {
        (0..self.entries).filter(|&i| self.is_set(i)).count()
    }

    fn set_range(&mut self, idx: usize, count: usize) {
        for i in idx..idx + count {
            self.bits[i / 8] |= 1 << (i % 8);
        }
        self.free -= count;
    }

    fn range_is_clear(&self, idx: usize, count: usize) -> bool {
        (idx..idx + count).all(|i| !self.is_set(i))
    }

    /// Allocate `count` consecutive frames, lowest index first.
    ///
    /// Returns the index of the first frame, or `None` if no run is long enough.
    pub fn allocate(&mut self, count: usize) -> Option<usize> {
        if count == 0 || count > self.free {
            return None;
        }
        if count == 1 {
            let byte = self.bits.iter().position(|&b| b != 0xFF)?;
            let idx = byte * 8 + (!self.bits[byte]).trailing_zeros() as usize;
            // Only padding bits are set past `entries`, so this always holds.
            debug_assert!(idx < self.entries);
            self.set_range(idx, 1);
            return Some(idx);
        }

        let mut run_start = 0;
        let mut run_len = 0;
        let mut i = 0;
        while i < self.entries {
            if i % 8 == 0 && self.bits[i / 8] == 0xFF {
                run_len = 0;
                i += 8;
                continue;
            }
            if self.is_set(i) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len == count {
                    self.set_range(run_start, count);
                    return Some(run_start);
                }
            }
            i += 1;
        }
        None
    }

    /// Allocate `count` consecutive frames whose first index `i` satisfies
    /// `(i + phase) % align == 0`, lowest index first.
    ///
    /// `phase` lets a region align in absolute frame numbers: pass the frame
    /// number of the region's first frame.
    pub fn allocate_aligned(&mut self, count: usize, align: usize, phase: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        if align <= 1 {
            return self.allocate(count);
        }
        if count == 0 || count > self.free {
            return None;
        }
        let mut idx = (align - phase % align) % align;
        while idx + count <= self.entries {
            if self.range_is_clear(idx, count) {
                self.set_range(idx, count);
                return Some(idx);
            }
            idx += align;
        }
        None
    }

    /// Mark `count` frames at `idx` allocated regardless of their state.
    ///
    /// Returns how many were free before. Used for boot-time reservations.
    pub fn reserve(&mut self, idx: usize, count: usize) -> usize {
        let end = (idx + count).min(self.entries);
        let mut newly = 0;
        for i in idx..end {
            if !self.is_set(i) {
                self.set_range(i, 1);
                newly += 1;
            }
        }
        newly
    }

    /// Release `count` frames starting at `idx`.
    ///
    /// # Panics
    /// If the range leaves the bitmap or any bit in it is already clear. The
    /// whole range is checked before any bit changes, so a double free leaves
    /// the bitmap exactly as it was.
    pub fn free(&mut self, idx: usize, count: usize) {
        assert!(
            idx + count <= self.entries,
            "free of frames {idx}..{} beyond bitmap of {} entries",
            idx + count,
            self.entries
        );
        if let Some(bad) = (idx..idx + count).find(|&i| !self.is_set(i)) {
            panic!("double free of frame bit {bad} (freeing {idx}..{})", idx + count);
        }
        for i in idx..idx + count {
            self.bits[i / 8] &= !(1 << (i % 8));
        }
        self.free += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn padding_bits_are_never_handed_out() {
        let mut storage = [0u8; 2];
        let mut bm = FrameBitmap::new(&mut storage, 10).unwrap();
        for expected in 0..10 {
            assert_eq!(bm.allocate(1), Some(expected));
        }
        assert_eq!(bm.allocate(1), None);
        assert_eq!(bm.free_count(), 0);
    }

    #[test]
    fn storage_must_cover_all_entries() {
        let mut storage = [0u8; 1];
        assert!(matches!(
            FrameBitmap::new(&mut storage, 9),
            Err(PmmError::BitmapTooSmall)
        ));
    }

    #[test]
    fn single_allocation_skips_full_bytes_and_reuses_lowest() {
        let mut storage = [0u8; 4];
        let mut bm = FrameBitmap::new(&mut storage, 32).unwrap();
        for _ in 0..20 {
            bm.allocate(1).unwrap();
        }
        bm.free(3, 1);
        bm.free(17, 1);
        assert_eq!(bm.allocate(1), Some(3));
        assert_eq!(bm.allocate(1), Some(17));
        assert_eq!(bm.allocate(1), Some(20));
    }

    #[test]
    fn runs_take_the_first_fit() {
        let mut storage = [0u8; 4];
        let mut bm = FrameBitmap::new(&mut storage, 32).unwrap();
        bm.reserve(2, 1);
        bm.reserve(6, 1);
        // [0,2) is too short, [3,6) fits 3.
        assert_eq!(bm.allocate(3), Some(3));
        assert_eq!(bm.allocate(2), Some(0));
        assert_eq!(bm.allocate(8), Some(7));
        assert_eq!(bm.allocate(32), None);
    }

    #[test]
    fn aligned_runs_respect_phase() {
        let mut storage = [0u8; 4];
        let mut bm = FrameBitmap::new(&mut storage, 32).unwrap();
        // Region starts at absolute frame 3: index 1 is absolute frame 4.
        assert_eq!(bm.allocate_aligned(4, 4, 3), Some(1));
        assert_eq!(bm.allocate_aligned(4, 4, 3), Some(5));
        assert_eq!(bm.allocate_aligned(2, 1, 3), Some(0));
    }

    #[test]
    fn set_bits_match_accounting() {
        let mut storage = [0u8; 8];
        let mut bm = FrameBitmap::new(&mut storage, 60).unwrap();
        let a = bm.allocate(5).unwrap();
        bm.allocate(1).unwrap();
        bm.allocate_aligned(8, 8, 0).unwrap();
        bm.free(a, 5);
        assert_eq!(bm.count_set(), bm.len() - bm.free_count());
    }

    #[test]
    fn double_free_panics_once_and_preserves_other_bits() {
        let mut storage = [0u8; 2];
        let mut bm = FrameBitmap::new(&mut storage, 16).unwrap();
        let idx = bm.allocate(4).unwrap();
        bm.allocate(1).unwrap();
        bm.free(idx, 4);
        bm.allocate(1).unwrap(); // takes bit 0 again

        let before: Vec<bool> = (0..16).map(|i| bm.is_set(i)).collect();
        let free_before = bm.free_count();

        let result = catch_unwind(AssertUnwindSafe(|| bm.free(idx, 4)));
        assert!(result.is_err());

        let after: Vec<bool> = (0..16).map(|i| bm.is_set(i)).collect();
        assert_eq!(before, after);
        assert_eq!(bm.free_count(), free_before);
    }

    #[test]
    #[should_panic(expected = "beyond bitmap")]
    fn free_past_end_is_fatal() {
        let mut storage = [0u8; 1];
        let mut bm = FrameBitmap::new(&mut storage, 8).unwrap();
        bm.free(7, 2);
    }
}
