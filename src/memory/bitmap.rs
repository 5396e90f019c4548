//! Lock-free slot occupancy bitmap.

use std::sync::atomic::{AtomicU64, Ordering};

/// Occupancy bitmap for a fixed number of slots: bit set = slot loaned.
///
/// `acquire` scans 64-bit words for a clear bit and claims it with a CAS;
/// `release` clears the bit and reports whether it was set, which lets the
/// pool detect a slot returned twice.
pub(crate) struct SlotBitmap {
    words: Box<[AtomicU64]>,
    slots: usize,
}

impl SlotBitmap {
    pub(crate) fn new(slots: usize) -> Self {
        Self {
            words: (0..slots.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            slots,
        }
    }

    /// Claim the lowest free slot.
    pub(crate) fn acquire(&self) -> Option<usize> {
        for (w, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Relaxed);
            while current != u64::MAX {
                let bit = (!current).trailing_zeros() as usize;
                let slot = w * 64 + bit;
                if slot >= self.slots {
                    return None;
                }
                match word.compare_exchange_weak(
                    current,
                    current | (1 << bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(slot),
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    /// Free `slot`. Returns `false` if it was not loaned.
    pub(crate) fn release(&self, slot: usize) -> bool {
        if slot >= self.slots {
            return false;
        }
        let mask = 1u64 << (slot % 64);
        self.words[slot / 64].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Number of loaned slots (snapshot).
    pub(crate) fn loaned(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots
    }
}
