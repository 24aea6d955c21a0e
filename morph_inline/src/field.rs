//! Field descriptors for inlined state.
//!
//! A descriptor is a plain value computed once at setup: it names *where* a
//! logical field lives in an [`InlineStorage`] and carries no data itself.

use crate::bits::BitRange;
use crate::storage::{InlineStorage, SharedRef};
use morph_core::{ConfigError, DispatchError, DispatchResult};
use std::any::{Any, TypeId};
use std::sync::Arc;

// =============================================================================
// State Field
// =============================================================================

/// A bit-field of at most 32 bits in the packed state words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateField {
    range: BitRange,
}

impl StateField {
    /// Maximum width of a state field.
    pub const MAX_BITS: u32 = 32;

    /// Wrap a range.
    pub fn new(range: BitRange) -> Result<Self, ConfigError> {
        if range.len() > Self::MAX_BITS {
            return Err(ConfigError::InvalidBitRange {
                offset: range.start(),
                len: range.len(),
                reason: "state fields are at most 32 bits wide",
            });
        }
        Ok(Self { range })
    }

    /// Underlying range.
    #[inline]
    pub fn range(&self) -> BitRange {
        self.range
    }

    /// Width in bits.
    #[inline]
    pub fn bit_len(&self) -> u32 {
        self.range.len()
    }

    /// Descriptor for a subset of this field's bits.
    pub fn sub_field(&self, offset: u32, len: u32) -> Result<StateField, ConfigError> {
        Ok(Self {
            range: self.range.sub_range(offset, len)?,
        })
    }

    /// Current value.
    #[inline(always)]
    pub fn get(&self, storage: &InlineStorage) -> u32 {
        storage.read(self.range) as u32
    }

    /// Replace the value; other bits of the word are preserved.
    #[inline]
    pub fn set(&self, storage: &InlineStorage, value: u32) -> Result<(), ConfigError> {
        storage.write(self.range, value as u64).map(|_| ())
    }

    /// Set bit `index` of this field.
    ///
    /// Returns `true` if the bit was newly set.
    pub fn set_flag(&self, storage: &InlineStorage, index: u32) -> Result<bool, ConfigError> {
        let bit = self.range.bit(index)?;
        let previous = storage.write(bit, 1)?;
        Ok(previous == 0)
    }

    /// Whether bit `index` of this field is set.
    #[inline]
    pub fn flag(&self, storage: &InlineStorage, index: u32) -> bool {
        index < self.range.len() && (self.get(storage) >> index) & 1 == 1
    }
}

// =============================================================================
// Primitive Field
// =============================================================================

/// Representation of a primitive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// `bool`
    Bool,
    /// `i8`
    Byte,
    /// `i16`
    Short,
    /// `u16` code unit
    Char,
    /// `i32`
    Int,
    /// `i64`
    Long,
    /// `f32`
    Float,
    /// `f64`
    Double,
}

impl PrimitiveKind {
    /// Name for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Bool => "bool",
            PrimitiveKind::Byte => "byte",
            PrimitiveKind::Short => "short",
            PrimitiveKind::Char => "char",
            PrimitiveKind::Int => "int",
            PrimitiveKind::Long => "long",
            PrimitiveKind::Float => "float",
            PrimitiveKind::Double => "double",
        }
    }
}

/// A primitive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitiveField {
    index: usize,
    kind: PrimitiveKind,
}

impl PrimitiveField {
    /// Describe slot `index` holding `kind`.
    pub const fn new(index: usize, kind: PrimitiveKind) -> Self {
        Self { index, kind }
    }

    /// Slot index.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Declared kind.
    #[inline]
    pub fn kind(&self) -> PrimitiveKind {
        self.kind
    }

    fn expect(&self, kind: PrimitiveKind) -> DispatchResult<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(DispatchError::TypeMismatch {
                expected: kind.name().to_string(),
                actual: self.kind.name().to_string(),
            })
        }
    }

    fn load(&self, storage: &InlineStorage) -> DispatchResult<u64> {
        storage
            .load_primitive(self.index)
            .ok_or_else(|| out_of_range("primitive", self.index))
    }

    fn store(&self, storage: &InlineStorage, bits: u64) -> DispatchResult<()> {
        if storage.store_primitive(self.index, bits) {
            Ok(())
        } else {
            Err(out_of_range("primitive", self.index))
        }
    }

    /// Read an `int` slot.
    pub fn get_int(&self, storage: &InlineStorage) -> DispatchResult<i32> {
        self.expect(PrimitiveKind::Int)?;
        Ok(self.load(storage)? as u32 as i32)
    }

    /// Write an `int` slot.
    pub fn set_int(&self, storage: &InlineStorage, value: i32) -> DispatchResult<()> {
        self.expect(PrimitiveKind::Int)?;
        self.store(storage, value as u32 as u64)
    }

    /// Saturating increment of an `int` slot, returning the new value.
    pub fn increment_int(&self, storage: &InlineStorage) -> DispatchResult<i32> {
        self.expect(PrimitiveKind::Int)?;
        let previous = storage
            .update_primitive(self.index, |bits| {
                let v = bits as u32 as i32;
                v.saturating_add(1) as u32 as u64
            })
            .ok_or_else(|| out_of_range("primitive", self.index))?;
        Ok((previous as u32 as i32).saturating_add(1))
    }

    /// Read a `long` slot.
    pub fn get_long(&self, storage: &InlineStorage) -> DispatchResult<i64> {
        self.expect(PrimitiveKind::Long)?;
        Ok(self.load(storage)? as i64)
    }

    /// Write a `long` slot.
    pub fn set_long(&self, storage: &InlineStorage, value: i64) -> DispatchResult<()> {
        self.expect(PrimitiveKind::Long)?;
        self.store(storage, value as u64)
    }

    /// Read a `double` slot.
    pub fn get_double(&self, storage: &InlineStorage) -> DispatchResult<f64> {
        self.expect(PrimitiveKind::Double)?;
        Ok(f64::from_bits(self.load(storage)?))
    }

    /// Write a `double` slot.
    pub fn set_double(&self, storage: &InlineStorage, value: f64) -> DispatchResult<()> {
        self.expect(PrimitiveKind::Double)?;
        self.store(storage, value.to_bits())
    }

    /// Read a `bool` slot.
    pub fn get_bool(&self, storage: &InlineStorage) -> DispatchResult<bool> {
        self.expect(PrimitiveKind::Bool)?;
        Ok(self.load(storage)? != 0)
    }

    /// Write a `bool` slot.
    pub fn set_bool(&self, storage: &InlineStorage, value: bool) -> DispatchResult<()> {
        self.expect(PrimitiveKind::Bool)?;
        self.store(storage, value as u64)
    }
}

// =============================================================================
// Reference Field
// =============================================================================

/// A reference slot holding values of one Rust type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceField {
    index: usize,
    value_type: TypeId,
    type_name: &'static str,
}

impl ReferenceField {
    /// Describe slot `index` holding `Arc<T>`.
    pub fn new<T: Any + Send + Sync>(index: usize) -> Self {
        Self {
            index,
            value_type: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Describe slot `index` from raw type information.
    pub(crate) fn from_parts(index: usize, value_type: TypeId, type_name: &'static str) -> Self {
        Self {
            index,
            value_type,
            type_name,
        }
    }

    /// Slot index.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Declared value type name.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the slot holds values of type `T`.
    #[inline]
    pub fn holds<T: Any>(&self) -> bool {
        self.value_type == TypeId::of::<T>()
    }

    fn expect<T: Any>(&self) -> DispatchResult<()> {
        if self.holds::<T>() {
            Ok(())
        } else {
            Err(DispatchError::TypeMismatch {
                expected: std::any::type_name::<T>().to_string(),
                actual: self.type_name.to_string(),
            })
        }
    }

    /// Read the slot.
    pub fn get<T: Any + Send + Sync>(&self, storage: &InlineStorage) -> DispatchResult<Option<Arc<T>>> {
        self.expect::<T>()?;
        match storage.load_reference(self.index) {
            None => Ok(None),
            Some(shared) => shared.downcast::<T>().map(Some).map_err(|_| DispatchError::TypeMismatch {
                expected: std::any::type_name::<T>().to_string(),
                actual: "foreign reference".to_string(),
            }),
        }
    }

    /// Replace the slot.
    pub fn set<T: Any + Send + Sync>(
        &self,
        storage: &InlineStorage,
        value: Option<Arc<T>>,
    ) -> DispatchResult<()> {
        self.expect::<T>()?;
        let erased = value.map(|v| v as SharedRef);
        if storage.store_reference(self.index, erased) {
            Ok(())
        } else {
            Err(out_of_range("reference", self.index))
        }
    }

    /// Store `value` only if the slot still holds `expected`.
    pub fn compare_and_set<T: Any + Send + Sync>(
        &self,
        storage: &InlineStorage,
        expected: Option<&Arc<T>>,
        value: Option<Arc<T>>,
    ) -> DispatchResult<bool> {
        self.expect::<T>()?;
        let expected = expected.map(|e| Arc::clone(e) as SharedRef);
        Ok(storage.compare_and_set_reference(
            self.index,
            expected.as_ref(),
            value.map(|v| v as SharedRef),
        ))
    }
}

// =============================================================================
// Inlinable Field
// =============================================================================

/// Any field an inline target can hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlinableField {
    /// Packed state bits.
    State(StateField),
    /// Primitive slot.
    Primitive(PrimitiveField),
    /// Reference slot.
    Reference(ReferenceField),
}

impl InlinableField {
    /// Kind name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            InlinableField::State(_) => "StateField",
            InlinableField::Primitive(p) => match p.kind() {
                PrimitiveKind::Bool => "BooleanField",
                PrimitiveKind::Byte => "ByteField",
                PrimitiveKind::Short => "ShortField",
                PrimitiveKind::Char => "CharField",
                PrimitiveKind::Int => "IntField",
                PrimitiveKind::Long => "LongField",
                PrimitiveKind::Float => "FloatField",
                PrimitiveKind::Double => "DoubleField",
            },
            InlinableField::Reference(_) => "ReferenceField",
        }
    }
}

fn out_of_range(kind: &str, index: usize) -> DispatchError {
    DispatchError::TypeMismatch {
        expected: format!("{} slot {}", kind, index),
        actual: "missing slot".to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================
