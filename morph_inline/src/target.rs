//! Inline targets.
//!
//! An [`InlineTarget`] is the ordered list of field descriptors a parent
//! reserved for one inlined node. The inlined node asks for its fields by
//! index and kind; every request is checked against what was reserved.

use crate::field::{InlinableField, PrimitiveField, PrimitiveKind, ReferenceField, StateField};
use morph_core::{ConfigError, DispatchError, DispatchResult};
use std::any::Any;

/// Field descriptors reserved for one inlined node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineTarget {
    target: String,
    fields: Vec<InlinableField>,
}

impl InlineTarget {
    /// Create a target for the node type `target`.
    pub fn new(target: impl Into<String>, fields: Vec<InlinableField>) -> Self {
        Self {
            target: target.into(),
            fields,
        }
    }

    /// Node type the fields were reserved for.
    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Number of reserved fields.
    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no field was reserved.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// All reserved fields in order.
    pub fn fields(&self) -> &[InlinableField] {
        &self.fields
    }

    fn field(&self, index: usize, expected: &str) -> DispatchResult<&InlinableField> {
        self.fields.get(index).ok_or_else(|| DispatchError::TypeMismatch {
            expected: format!("{} at index {}", expected, index),
            actual: format!("{} fields reserved for '{}'", self.fields.len(), self.target),
        })
    }

    /// State field at `index` holding at least `minimum_bits` bits.
    pub fn get_state(&self, index: usize, minimum_bits: u32) -> DispatchResult<StateField> {
        if minimum_bits == 0 || minimum_bits > StateField::MAX_BITS {
            return Err(ConfigError::InvalidBitRange {
                offset: 0,
                len: minimum_bits,
                reason: "requested state width must be between 1 and 32 bits",
            }
            .into());
        }
        match self.field(index, "StateField")? {
            InlinableField::State(state) if state.bit_len() >= minimum_bits => Ok(*state),
            InlinableField::State(state) => Err(DispatchError::TypeMismatch {
                expected: format!("StateField with at least {} bits", minimum_bits),
                actual: format!("StateField with {} bits", state.bit_len()),
            }),
            other => Err(DispatchError::TypeMismatch {
                expected: "StateField".to_string(),
                actual: other.kind_name().to_string(),
            }),
        }
    }

    /// Primitive field at `index` of representation `kind`.
    pub fn get_primitive(&self, index: usize, kind: PrimitiveKind) -> DispatchResult<PrimitiveField> {
        match self.field(index, kind.name())? {
            InlinableField::Primitive(p) if p.kind() == kind => Ok(*p),
            other => Err(DispatchError::TypeMismatch {
                expected: kind.name().to_string(),
                actual: other.kind_name().to_string(),
            }),
        }
    }

    /// Reference field at `index` holding `T`.
    pub fn get_reference<T: Any + Send + Sync>(&self, index: usize) -> DispatchResult<ReferenceField> {
        let expected = std::any::type_name::<T>();
        match self.field(index, "ReferenceField")? {
            InlinableField::Reference(r) if r.holds::<T>() => Ok(*r),
            InlinableField::Reference(r) => Err(DispatchError::TypeMismatch {
                expected: expected.to_string(),
                actual: r.type_name().to_string(),
            }),
            other => Err(DispatchError::TypeMismatch {
                expected: "ReferenceField".to_string(),
                actual: other.kind_name().to_string(),
            }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitRange;

    fn sample() -> InlineTarget {
        let state = StateField::new(BitRange::new(0, 0, 4).unwrap()).unwrap();
        InlineTarget::new(
            "Sample",
            vec![
                InlinableField::State(state),
                InlinableField::Primitive(PrimitiveField::new(0, PrimitiveKind::Int)),
                InlinableField::Reference(ReferenceField::new::<String>(0)),
            ],
        )
    }

    #[test]
    fn test_matching_requests() {
        let t = sample();
        assert_eq!(t.get_state(0, 4).unwrap().bit_len(), 4);
        assert_eq!(t.get_state(0, 2).unwrap().bit_len(), 4);
        assert_eq!(t.get_primitive(1, PrimitiveKind::Int).unwrap().index(), 0);
        assert!(t.get_reference::<String>(2).is_ok());
    }

    #[test]
    fn test_state_too_narrow() {
        let err = sample().get_state(0, 5).unwrap_err();
        assert!(matches!(err, DispatchError::TypeMismatch { .. }));
    }

    #[test]
    fn test_invalid_state_width_request() {
        let t = sample();
        assert!(matches!(t.get_state(0, 0), Err(DispatchError::Config(_))));
        assert!(matches!(t.get_state(0, 33), Err(DispatchError::Config(_))));
    }

    #[test]
    fn test_kind_and_index_mismatch() {
        let t = sample();
        assert!(t.get_primitive(1, PrimitiveKind::Long).is_err());
        assert!(t.get_primitive(0, PrimitiveKind::Int).is_err());
        assert!(t.get_reference::<u64>(2).is_err());
        assert!(t.get_reference::<String>(1).is_err());
        let err = t.get_state(7, 1).unwrap_err();
        assert!(err.to_string().contains("index 7"));
    }
}
