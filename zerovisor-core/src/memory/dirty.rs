//! Dirty-page bitmap: one bit per guest 4 KiB page, with generation-bumping
//! atomic clear (§3 `DirtyBitmap`, §4.3 "dirty tracking").
//!
//! Grounded in the teacher's `zerovisor-hal::dirty` (`SoftDirtyTracker`, a
//! global `BTreeSet<u64>` of dirty page numbers guarded by `spin::Mutex`);
//! this version is page-indexed (a `Vec<u64>` bitmap) rather than a sorted
//! set, since the migration engine needs to iterate the full dirty set every
//! precopy round and a bitmap scan is cheaper than a tree walk at that
//! access pattern, and uses `std::sync::Mutex` in place of `spin::Mutex` for
//! the same hosted-environment reason recorded in SPEC_FULL.md.

use std::sync::Mutex;

/// Tracks dirty guest pages across migration precopy iterations.
pub struct DirtyBitmap {
    inner: Mutex<Inner>,
    total_pages: u64,
}

struct Inner {
    bits: Vec<u64>,
    generation: u64,
    enabled: bool,
}

impl DirtyBitmap {
    pub fn new(total_pages: u64) -> Self {
        let words = (total_pages as usize).div_ceil(64);
        Self {
            inner: Mutex::new(Inner { bits: vec![0u64; words], generation: 0, enabled: false }),
            total_pages,
        }
    }

    pub fn enable(&self) {
        self.inner.lock().unwrap().enabled = true;
    }

    pub fn disable(&self) {
        self.inner.lock().unwrap().enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    /// Sets the bit for `page_index`. A no-op (not an error) when tracking is
    /// disabled or the index is out of range, matching the hardware-assisted
    /// path where a stray dirty report outside the tracked range is ignored.
    pub fn mark_dirty(&self, page_index: u64) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled || page_index >= self.total_pages {
            return;
        }
        let word = (page_index / 64) as usize;
        let bit = page_index % 64;
        inner.bits[word] |= 1u64 << bit;
    }

    /// Returns the current dirty set as page indices. Monotonically
    /// non-decreasing within a generation (§8 invariant 5).
    pub fn dirty_pages(&self) -> Vec<u64> {
        let inner = self.inner.lock().unwrap();
        Self::collect(&inner.bits)
    }

    /// Returns the current dirty set and atomically clears it, bumping the
    /// generation counter.
    pub fn drain(&self) -> Vec<u64> {
        let mut inner = self.inner.lock().unwrap();
        let pages = Self::collect(&inner.bits);
        for word in inner.bits.iter_mut() {
            *word = 0;
        }
        inner.generation += 1;
        pages
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().unwrap().bits.iter().map(|w| w.count_ones() as u64).sum()
    }

    fn collect(bits: &[u64]) -> Vec<u64> {
        let mut out = Vec::new();
        for (word_idx, &word) in bits.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = w.trailing_zeros();
                out.push(word_idx as u64 * 64 + bit as u64);
                w &= w - 1;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracker_ignores_marks() {
        let bitmap = DirtyBitmap::new(1024);
        bitmap.mark_dirty(5);
        assert!(bitmap.dirty_pages().is_empty());
    }

    #[test]
    fn enabled_tracker_records_and_drains() {
        let bitmap = DirtyBitmap::new(1024);
        bitmap.enable();
        bitmap.mark_dirty(5);
        bitmap.mark_dirty(900);
        let mut pages = bitmap.dirty_pages();
        pages.sort_unstable();
        assert_eq!(pages, vec![5, 900]);

        let drained = bitmap.drain();
        assert_eq!(drained.len(), 2);
        assert!(bitmap.dirty_pages().is_empty());
        assert_eq!(bitmap.generation(), 1);
    }

    #[test]
    fn out_of_range_mark_is_ignored() {
        let bitmap = DirtyBitmap::new(4);
        bitmap.enable();
        bitmap.mark_dirty(1000);
        assert!(bitmap.dirty_pages().is_empty());
    }
}
