//! Inlinable node descriptions and parent region layout.
//!
//! A node type that wants to live inside its parent's storage describes the
//! fields it needs as an [`InlinableSpec`]. The parent's [`RegionLayout`]
//! validates the spec, reserves bits and slots for it and returns the
//! [`InlineTarget`] the inlined node reads its fields through.

use crate::allocator::BitAllocator;
use crate::bits::BitRange;
use crate::field::{InlinableField, PrimitiveField, PrimitiveKind, ReferenceField, StateField};
use crate::storage::InlineStorage;
use crate::target::InlineTarget;
use morph_core::ConfigError;
use std::any::{Any, TypeId};
use tracing::{debug, warn};

// =============================================================================
// Inlinable Spec
// =============================================================================

/// A reference slot requested by an inlinable node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSpec {
    /// Field name.
    pub name: String,
    value_type: TypeId,
    type_name: &'static str,
}

impl ReferenceSpec {
    /// Request a slot holding `Arc<T>`.
    pub fn of<T: Any + Send + Sync>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }
}

/// Storage requirements of an inlinable node type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlinableSpec {
    /// Node type name.
    pub name: String,
    /// Requested state fields as `(name, bits)`.
    pub state_bits: Vec<(String, u32)>,
    /// Requested primitive slots.
    pub primitives: Vec<(String, PrimitiveKind)>,
    /// Requested reference slots.
    pub references: Vec<ReferenceSpec>,
    /// Private mutable fields the node type declares. Must be empty.
    pub instance_fields: Vec<String>,
    /// Nested inlinable nodes.
    pub children: Vec<InlinableSpec>,
}

impl InlinableSpec {
    /// Start describing the node type `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Request a state field.
    pub fn state(mut self, name: impl Into<String>, bits: u32) -> Self {
        self.state_bits.push((name.into(), bits));
        self
    }

    /// Request a primitive slot.
    pub fn primitive(mut self, name: impl Into<String>, kind: PrimitiveKind) -> Self {
        self.primitives.push((name.into(), kind));
        self
    }

    /// Request a reference slot.
    pub fn reference(mut self, spec: ReferenceSpec) -> Self {
        self.references.push(spec);
        self
    }

    /// Record a private instance field.
    pub fn instance_field(mut self, name: impl Into<String>) -> Self {
        self.instance_fields.push(name.into());
        self
    }

    /// Nest an inlinable child.
    pub fn child(mut self, child: InlinableSpec) -> Self {
        self.children.push(child);
        self
    }

    /// Reject instance fields anywhere in the tree.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(field) = self.instance_fields.first() {
            return Err(ConfigError::InstanceFieldOnInlinable {
                node_type: self.name.clone(),
                field: field.clone(),
            });
        }
        self.children.iter().try_for_each(InlinableSpec::validate)
    }

    /// State bits needed by this node and its children.
    pub fn total_state_bits(&self) -> u32 {
        let own: u32 = self.state_bits.iter().map(|(_, b)| *b).sum();
        own + self
            .children
            .iter()
            .map(InlinableSpec::total_state_bits)
            .sum::<u32>()
    }
}

// =============================================================================
// Region Layout
// =============================================================================

/// Setup-time layout of one parent's storage region.
#[derive(Debug, Clone)]
pub struct RegionLayout {
    allocator: BitAllocator,
    primitives: usize,
    references: usize,
}

impl RegionLayout {
    /// Empty layout for a region of `capacity_bits` state bits.
    pub fn new(capacity_bits: u32) -> Self {
        Self {
            allocator: BitAllocator::with_capacity(capacity_bits),
            primitives: 0,
            references: 0,
        }
    }

    /// Bit allocator backing the state words.
    pub fn allocator(&self) -> &BitAllocator {
        &self.allocator
    }

    /// Reserve `bits` state bits for the parent itself.
    pub fn claim_state(&mut self, name: &str, bits: u32) -> Result<BitRange, ConfigError> {
        self.allocator.allocate(name, bits)
    }

    /// Reserve one primitive slot.
    pub fn claim_primitive(&mut self, kind: PrimitiveKind) -> PrimitiveField {
        let field = PrimitiveField::new(self.primitives, kind);
        self.primitives += 1;
        field
    }

    /// Validate `spec` and reserve everything it asks for.
    ///
    /// Children are flattened depth-first after the node's own fields.
    pub fn inline(&mut self, spec: &InlinableSpec) -> Result<InlineTarget, ConfigError> {
        if let Err(e) = spec.validate() {
            warn!(node_type = %spec.name, error = %e, "rejected inlinable node");
            return Err(e);
        }
        let mut fields = Vec::new();
        self.reserve(spec, &spec.name, &mut fields)?;
        debug!(
            node_type = %spec.name,
            fields = fields.len(),
            used_bits = self.allocator.used_bits(),
            "inlined node into parent region"
        );
        Ok(InlineTarget::new(spec.name.clone(), fields))
    }

    fn reserve(
        &mut self,
        spec: &InlinableSpec,
        path: &str,
        fields: &mut Vec<InlinableField>,
    ) -> Result<(), ConfigError> {
        for (name, bits) in &spec.state_bits {
            let range = self.allocator.allocate(&format!("{}.{}", path, name), *bits)?;
            fields.push(InlinableField::State(StateField::new(range)?));
        }
        for (_, kind) in &spec.primitives {
            fields.push(InlinableField::Primitive(self.claim_primitive(*kind)));
        }
        for reference in &spec.references {
            fields.push(InlinableField::Reference(ReferenceField::from_parts(
                self.references,
                reference.value_type,
                reference.type_name,
            )));
            self.references += 1;
        }
        for child in &spec.children {
            self.reserve(child, &format!("{}.{}", path, child.name), fields)?;
        }
        Ok(())
    }

    /// Allocate zeroed storage matching this layout.
    pub fn storage(&self, verify_bits: bool) -> InlineStorage {
        InlineStorage::new(
            self.allocator.word_count() as usize,
            self.primitives,
            self.references,
            verify_bits,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_field_rejected_recursively() {
        let spec = InlinableSpec::new("Outer")
            .state("s", 2)
            .child(InlinableSpec::new("Inner").instance_field("counter"));
        let err = spec.validate().unwrap_err();
        assert_eq!(
            err,
            ConfigError::InstanceFieldOnInlinable {
                node_type: "Inner".into(),
                field: "counter".into()
            }
        );
        let mut layout = RegionLayout::new(64);
        assert!(layout.inline(&spec).is_err());
    }

    #[test]
    fn test_inline_flattens_children() {
        let spec = InlinableSpec::new("Outer")
            .state("s", 3)
            .primitive("count", PrimitiveKind::Int)
            .child(
                InlinableSpec::new("Inner")
                    .state("t", 2)
                    .reference(ReferenceSpec::of::<String>("name")),
            );
        assert_eq!(spec.total_state_bits(), 5);

        let mut layout = RegionLayout::new(64);
        layout.claim_state("parent", 4).unwrap();
        let target = layout.inline(&spec).unwrap();
        assert_eq!(target.len(), 4);

        let s = target.get_state(0, 3).unwrap();
        let t = target.get_state(2, 2).unwrap();
        assert_eq!(s.range().offset(), 4);
        assert_eq!(t.range().offset(), 7);
        assert!(layout.allocator().claim("Outer.Inner.t").is_some());

        let storage = layout.storage(true);
        assert_eq!(storage.word_count(), 1);
        assert_eq!(storage.primitive_count(), 1);
        assert_eq!(storage.reference_count(), 1);

        s.set(&storage, 5).unwrap();
        t.set(&storage, 3).unwrap();
        assert_eq!(s.get(&storage), 5);
        assert_eq!(t.get(&storage), 3);
    }

    #[test]
    fn test_inline_overflows_region() {
        let mut layout = RegionLayout::new(8);
        let spec = InlinableSpec::new("Wide").state("a", 6).state("b", 4);
        assert!(matches!(
            layout.inline(&spec),
            Err(ConfigError::BitWidthOverflow { .. })
        ));
    }
}
