//! Atomic backing storage for packed state and inlined fields.
//!
//! # Concurrency
//!
//! Readers load words with `Acquire`; writers update them with
//! compare-exchange loops (`AcqRel`). A masked write only replaces the bits of
//! its own range, so concurrent writers of neighbouring ranges never lose each
//! other's updates, and readers always observe some complete word value.

use crate::bits::BitRange;
use morph_core::ConfigError;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Type-erased reference stored in a reference slot.
pub type SharedRef = Arc<dyn Any + Send + Sync>;

/// Storage region owned by one parent node.
pub struct InlineStorage {
    words: Box<[AtomicU64]>,
    primitives: Box<[AtomicU64]>,
    references: Box<[RwLock<Option<SharedRef>>]>,
    verify_bits: bool,
}

impl InlineStorage {
    /// Allocate zeroed storage.
    pub fn new(
        word_count: usize,
        primitive_count: usize,
        reference_count: usize,
        verify_bits: bool,
    ) -> Self {
        Self {
            words: (0..word_count).map(|_| AtomicU64::new(0)).collect(),
            primitives: (0..primitive_count).map(|_| AtomicU64::new(0)).collect(),
            references: (0..reference_count).map(|_| RwLock::new(None)).collect(),
            verify_bits,
        }
    }

    /// Number of state words.
    #[inline]
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Number of primitive slots.
    #[inline]
    pub fn primitive_count(&self) -> usize {
        self.primitives.len()
    }

    /// Number of reference slots.
    #[inline]
    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    // =========================================================================
    // State Words
    // =========================================================================

    /// Load a whole word.
    #[inline(always)]
    pub fn load_word(&self, word: u32) -> u64 {
        debug_assert!((word as usize) < self.words.len());
        self.words
            .get(word as usize)
            .map_or(0, |w| w.load(Ordering::Acquire))
    }

    /// Read the value held in `range`.
    #[inline(always)]
    pub fn read(&self, range: BitRange) -> u64 {
        (self.load_word(range.word()) & range.mask()) >> range.offset()
    }

    /// Whether any bit of `range` is set.
    #[inline(always)]
    pub fn any(&self, range: BitRange) -> bool {
        self.load_word(range.word()) & range.mask() != 0
    }

    /// Replace the bits of `range` with `value`, leaving all other bits intact.
    ///
    /// Returns the previous value of the range.
    pub fn write(&self, range: BitRange, value: u64) -> Result<u64, ConfigError> {
        let written = value & range.max_value();
        if self.verify_bits && written != value {
            return Err(ConfigError::BitsLost {
                provided: value,
                written,
            });
        }
        let word = self.word(range)?;
        let mask = range.mask();
        let shifted = written << range.offset();
        let previous = word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                Some((old & !mask) | shifted)
            })
            .unwrap_or_else(|old| old);
        Ok((previous & mask) >> range.offset())
    }

    /// Atomically apply `update` to the value held in `range`.
    ///
    /// `update` may run several times under contention and must be pure.
    pub fn update<F>(&self, range: BitRange, update: F) -> Result<u64, ConfigError>
    where
        F: Fn(u64) -> u64,
    {
        let word = self.word(range)?;
        let mask = range.mask();
        let max = range.max_value();
        let verify = self.verify_bits;
        let mut lost = None;
        let previous = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
            let current = (old & mask) >> range.offset();
            let next = update(current);
            if verify && next & !max != 0 {
                lost = Some(next);
                return None;
            }
            Some((old & !mask) | ((next & max) << range.offset()))
        });
        match previous {
            Ok(old) => Ok((old & mask) >> range.offset()),
            Err(_) => {
                let provided = lost.unwrap_or_default();
                Err(ConfigError::BitsLost {
                    provided,
                    written: provided & max,
                })
            }
        }
    }

    /// Set every bit of `range`.
    #[inline]
    pub fn set_all(&self, range: BitRange) -> Result<(), ConfigError> {
        self.word(range)?.fetch_or(range.mask(), Ordering::AcqRel);
        Ok(())
    }

    /// Clear every bit of `range`.
    #[inline]
    pub fn clear_all(&self, range: BitRange) -> Result<(), ConfigError> {
        self.word(range)?.fetch_and(!range.mask(), Ordering::AcqRel);
        Ok(())
    }

    fn word(&self, range: BitRange) -> Result<&AtomicU64, ConfigError> {
        self.words
            .get(range.word() as usize)
            .ok_or(ConfigError::InvalidBitRange {
                offset: range.start(),
                len: range.len(),
                reason: "range lies outside the storage region",
            })
    }

    // =========================================================================
    // Primitive Slots
    // =========================================================================

    /// Raw bits of a primitive slot.
    #[inline]
    pub fn load_primitive(&self, index: usize) -> Option<u64> {
        self.primitives.get(index).map(|p| p.load(Ordering::Acquire))
    }

    /// Store raw bits into a primitive slot. Returns `false` when out of range.
    #[inline]
    pub fn store_primitive(&self, index: usize, bits: u64) -> bool {
        match self.primitives.get(index) {
            Some(p) => {
                p.store(bits, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Atomically transform a primitive slot, returning the previous bits.
    pub fn update_primitive<F>(&self, index: usize, update: F) -> Option<u64>
    where
        F: Fn(u64) -> u64,
    {
        let slot = self.primitives.get(index)?;
        let previous = slot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| Some(update(old)))
            .unwrap_or_else(|old| old);
        Some(previous)
    }

    // =========================================================================
    // Reference Slots
    // =========================================================================

    /// Current reference in a slot.
    #[inline]
    pub fn load_reference(&self, index: usize) -> Option<SharedRef> {
        self.references.get(index).and_then(|r| r.read().clone())
    }

    /// Replace a reference slot. Returns `false` when out of range.
    pub fn store_reference(&self, index: usize, value: Option<SharedRef>) -> bool {
        match self.references.get(index) {
            Some(slot) => {
                *slot.write() = value;
                true
            }
            None => false,
        }
    }

    /// Store `value` only if the slot still holds `expected` (by identity).
    pub fn compare_and_set_reference(
        &self,
        index: usize,
        expected: Option<&SharedRef>,
        value: Option<SharedRef>,
    ) -> bool {
        let Some(slot) = self.references.get(index) else {
            return false;
        };
        let mut guard = slot.write();
        let matches = match (guard.as_ref(), expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => Arc::ptr_eq(current, expected),
            _ => false,
        };
        if matches {
            *guard = value;
        }
        matches
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Zero all words and primitives and drop all references.
    pub fn reset(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Release);
        }
        for p in self.primitives.iter() {
            p.store(0, Ordering::Release);
        }
        for r in self.references.iter() {
            *r.write() = None;
        }
    }
}

impl std::fmt::Debug for InlineStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let words: Vec<String> = self
            .words
            .iter()
            .map(|w| format!("{:#018x}", w.load(Ordering::Relaxed)))
            .collect();
        f.debug_struct("InlineStorage")
            .field("words", &words)
            .field("primitives", &self.primitives.len())
            .field("references", &self.references.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn range(word: u32, offset: u32, len: u32) -> BitRange {
        BitRange::new(word, offset, len).unwrap()
    }

    #[test]
    fn test_read_write() {
        let storage = InlineStorage::new(1, 0, 0, true);
        let r = range(0, 3, 4);
        assert_eq!(storage.write(r, 0b1011).unwrap(), 0);
        assert_eq!(storage.read(r), 0b1011);
        assert_eq!(storage.load_word(0), 0b1011 << 3);
    }

    #[test]
    fn test_adjacent_ranges_are_isolated() {
        let storage = InlineStorage::new(1, 0, 0, true);
        let left = range(0, 0, 8);
        let mid = range(0, 8, 8);
        let right = range(0, 16, 8);

        storage.write(left, 0xFF).unwrap();
        storage.write(right, 0xFF).unwrap();
        storage.write(mid, 0x00).unwrap();
        assert_eq!(storage.read(left), 0xFF);
        assert_eq!(storage.read(right), 0xFF);

        storage.write(mid, 0xFF).unwrap();
        storage.write(left, 0x00).unwrap();
        storage.write(right, 0x00).unwrap();
        assert_eq!(storage.read(mid), 0xFF);
        assert_eq!(storage.load_word(0), 0xFF00);
    }

    #[test]
    fn test_bits_lost_detected() {
        let storage = InlineStorage::new(1, 0, 0, true);
        let err = storage.write(range(0, 0, 2), 0b111).unwrap_err();
        assert_eq!(
            err,
            ConfigError::BitsLost {
                provided: 0b111,
                written: 0b11
            }
        );
        assert_eq!(storage.load_word(0), 0);
    }

    #[test]
    fn test_bits_truncated_without_verification() {
        let storage = InlineStorage::new(1, 0, 0, false);
        storage.write(range(0, 0, 2), 0b111).unwrap();
        assert_eq!(storage.load_word(0), 0b11);
    }

    #[test]
    fn test_update_rejects_overflow() {
        let storage = InlineStorage::new(1, 0, 0, true);
        let r = range(0, 4, 2);
        assert_eq!(storage.update(r, |v| v + 1).unwrap(), 0);
        assert_eq!(storage.update(r, |v| v + 2).unwrap(), 1);
        assert!(storage.update(r, |v| v + 1).is_err());
        assert_eq!(storage.read(r), 3);
    }

    #[test]
    fn test_out_of_region_write() {
        let storage = InlineStorage::new(1, 0, 0, true);
        assert!(storage.write(range(2, 0, 1), 1).is_err());
    }

    #[test]
    fn test_concurrent_writers_never_lose_foreign_bits() {
        let storage = Arc::new(InlineStorage::new(1, 0, 0, true));
        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let storage = Arc::clone(&storage);
                thread::spawn(move || {
                    let r = range(0, i * 8, 8);
                    for v in 0..=255u64 {
                        storage.write(r, v).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(storage.load_word(0), u64::MAX);
    }

    #[test]
    fn test_primitive_and_reference_slots() {
        let storage = InlineStorage::new(0, 2, 1, true);
        assert!(storage.store_primitive(1, 42));
        assert_eq!(storage.load_primitive(1), Some(42));
        assert_eq!(storage.update_primitive(1, |v| v + 1), Some(42));
        assert_eq!(storage.load_primitive(1), Some(43));
        assert_eq!(storage.load_primitive(2), None);

        let value: SharedRef = Arc::new(String::from("cached"));
        assert!(storage.compare_and_set_reference(0, None, Some(Arc::clone(&value))));
        assert!(!storage.compare_and_set_reference(0, None, None));
        let loaded = storage.load_reference(0).unwrap();
        assert_eq!(loaded.downcast_ref::<String>().unwrap(), "cached");

        storage.reset();
        assert!(storage.load_reference(0).is_none());
        assert_eq!(storage.load_primitive(1), Some(0));
    }
}
