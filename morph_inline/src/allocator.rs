//! Setup-time bit allocation.
//!
//! A [`BitAllocator`] hands out non-overlapping [`BitRange`]s from a region
//! with a declared capacity. Ranges are packed densely; a request that does
//! not fit in the rest of the current word starts the next word. The region
//! grows from 8 to 16, 32, 64 bits and then to multiple words as claims are
//! added.

use crate::bits::{BitRange, StorageWidth, WORD_BITS};
use morph_core::ConfigError;

/// A named claim on the region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitClaim {
    /// Claim owner, for diagnostics.
    pub name: String,
    /// Claimed bits.
    pub range: BitRange,
}

/// Allocator for one parent region.
#[derive(Debug, Clone)]
pub struct BitAllocator {
    capacity: u32,
    claims: Vec<BitClaim>,
    cursor: u32,
}

impl BitAllocator {
    /// Create an empty allocator for a region of `capacity` bits.
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            capacity,
            claims: Vec::new(),
            cursor: 0,
        }
    }

    /// Declared capacity.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Claim the next `len` free bits.
    pub fn allocate(&mut self, name: &str, len: u32) -> Result<BitRange, ConfigError> {
        if len == 0 || len > WORD_BITS {
            return Err(ConfigError::InvalidBitRange {
                offset: self.cursor,
                len,
                reason: "claims must be between 1 and 64 bits",
            });
        }

        let mut start = self.cursor;
        loop {
            let (word, offset) = align(start, len);
            let candidate = BitRange::new(word, offset, len)?;
            if candidate.end() > self.capacity {
                return Err(ConfigError::BitWidthOverflow {
                    requested: candidate.end(),
                    capacity: self.capacity,
                });
            }
            match self.claims.iter().find(|c| c.range.overlaps(&candidate)) {
                // Skip past fixed claims sitting in the way.
                Some(blocking) => start = blocking.range.end(),
                None => {
                    self.cursor = self.cursor.max(candidate.end());
                    self.claims.push(BitClaim {
                        name: name.to_string(),
                        range: candidate,
                    });
                    return Ok(candidate);
                }
            }
        }
    }

    /// Claim a fixed range.
    pub fn allocate_at(&mut self, name: &str, range: BitRange) -> Result<(), ConfigError> {
        if range.end() > self.capacity {
            return Err(ConfigError::BitWidthOverflow {
                requested: range.end(),
                capacity: self.capacity,
            });
        }
        if let Some(other) = self.claims.iter().find(|c| c.range.overlaps(&range)) {
            return Err(ConfigError::OverlappingBits {
                name: name.to_string(),
                other: other.name.clone(),
            });
        }
        self.claims.push(BitClaim {
            name: name.to_string(),
            range,
        });
        Ok(())
    }

    /// Bits actually claimed.
    pub fn used_bits(&self) -> u32 {
        self.claims.iter().map(|c| c.range.len()).sum()
    }

    /// One past the highest claimed bit.
    pub fn high_water(&self) -> u32 {
        self.claims.iter().map(|c| c.range.end()).max().unwrap_or(0)
    }

    /// Words needed to back the region.
    pub fn word_count(&self) -> u32 {
        self.high_water().div_ceil(WORD_BITS)
    }

    /// Narrowest storage width holding every claim.
    pub fn width(&self) -> StorageWidth {
        StorageWidth::for_bits(self.high_water())
    }

    /// All claims in allocation order.
    pub fn claims(&self) -> &[BitClaim] {
        &self.claims
    }

    /// Find a claim by name.
    pub fn claim(&self, name: &str) -> Option<&BitClaim> {
        self.claims.iter().find(|c| c.name == name)
    }
}

/// Place `len` bits at or after global bit `start` without straddling a word.
#[inline]
fn align(start: u32, len: u32) -> (u32, u32) {
    let word = start / WORD_BITS;
    let offset = start % WORD_BITS;
    if offset + len > WORD_BITS {
        (word + 1, 0)
    } else {
        (word, offset)
    }
}

// =============================================================================
// Tests
// =============================================================================
