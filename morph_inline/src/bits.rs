//! Bit ranges and storage widths.

use morph_core::ConfigError;

/// Bits per storage word.
pub const WORD_BITS: u32 = 64;

// =============================================================================
// Bit Range
// =============================================================================

/// A contiguous range of bits inside one storage word.
///
/// Ranges never straddle words, which keeps every update a single-word
/// atomic read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitRange {
    word: u32,
    offset: u32,
    len: u32,
}

impl BitRange {
    /// Create a validated range.
    pub fn new(word: u32, offset: u32, len: u32) -> Result<Self, ConfigError> {
        if len == 0 {
            return Err(ConfigError::InvalidBitRange {
                offset,
                len,
                reason: "length must be positive",
            });
        }
        if offset >= WORD_BITS || offset + len > WORD_BITS {
            return Err(ConfigError::InvalidBitRange {
                offset,
                len,
                reason: "range must fit inside one 64-bit word",
            });
        }
        Ok(Self { word, offset, len })
    }

    /// Range covering a whole word.
    pub const fn whole_word(word: u32) -> Self {
        Self {
            word,
            offset: 0,
            len: WORD_BITS,
        }
    }

    /// Word index.
    #[inline]
    pub const fn word(&self) -> u32 {
        self.word
    }

    /// Bit offset inside the word.
    #[inline]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Number of bits.
    #[inline]
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// Always false; ranges have at least one bit.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First bit of the range counted across words.
    #[inline]
    pub const fn start(&self) -> u32 {
        self.word * WORD_BITS + self.offset
    }

    /// One past the last bit, counted across words.
    #[inline]
    pub const fn end(&self) -> u32 {
        self.start() + self.len
    }

    /// Largest value the range can hold.
    #[inline]
    pub const fn max_value(&self) -> u64 {
        if self.len >= WORD_BITS {
            u64::MAX
        } else {
            (1u64 << self.len) - 1
        }
    }

    /// In-word mask of the range.
    #[inline]
    pub const fn mask(&self) -> u64 {
        self.max_value() << self.offset
    }

    /// Whether two ranges share a bit.
    #[inline]
    pub fn overlaps(&self, other: &BitRange) -> bool {
        self.word == other.word && self.start() < other.end() && other.start() < self.end()
    }

    /// Sub-range relative to this range.
    pub fn sub_range(&self, offset: u32, len: u32) -> Result<BitRange, ConfigError> {
        if len == 0 {
            return Err(ConfigError::InvalidBitRange {
                offset,
                len,
                reason: "invalid new length",
            });
        }
        if offset + len > self.len {
            return Err(ConfigError::InvalidBitRange {
                offset,
                len,
                reason: "sub-range exceeds the available bit length",
            });
        }
        if offset == 0 && len == self.len {
            return Ok(*self);
        }
        BitRange::new(self.word, self.offset + offset, len)
    }

    /// The single bit at `index` within this range.
    pub fn bit(&self, index: u32) -> Result<BitRange, ConfigError> {
        self.sub_range(index, 1)
    }
}

// =============================================================================
// Storage Width
// =============================================================================

/// Narrowest storage able to hold a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageWidth {
    /// Fits in a byte.
    W8,
    /// Fits in 16 bits.
    W16,
    /// Fits in 32 bits.
    W32,
    /// Fits in one 64-bit word.
    W64,
    /// Needs several 64-bit words.
    Multi(u32),
}

impl StorageWidth {
    /// Width needed for `bits` bits.
    pub const fn for_bits(bits: u32) -> Self {
        if bits <= 8 {
            StorageWidth::W8
        } else if bits <= 16 {
            StorageWidth::W16
        } else if bits <= 32 {
            StorageWidth::W32
        } else if bits <= WORD_BITS {
            StorageWidth::W64
        } else {
            StorageWidth::Multi(bits.div_ceil(WORD_BITS))
        }
    }

    /// Number of 64-bit words backing this width.
    pub const fn words(self) -> u32 {
        match self {
            StorageWidth::Multi(n) => n,
            _ => 1,
        }
    }

    /// Total bit capacity.
    pub const fn bits(self) -> u32 {
        match self {
            StorageWidth::W8 => 8,
            StorageWidth::W16 => 16,
            StorageWidth::W32 => 32,
            StorageWidth::W64 => 64,
            StorageWidth::Multi(n) => n * WORD_BITS,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
