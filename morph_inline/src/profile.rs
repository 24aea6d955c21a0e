//! Inlined profiles.
//!
//! Small, monotonic pieces of profiling state that a specialization body
//! keeps in its parent's storage instead of in a child object.

use crate::field::{PrimitiveField, PrimitiveKind, StateField};
use crate::inlinable::InlinableSpec;
use crate::storage::InlineStorage;
use crate::target::InlineTarget;
use morph_core::DispatchResult;

// =============================================================================
// Branch Profile
// =============================================================================

/// Records whether a branch was ever taken. One state bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchProfile {
    state: StateField,
}

impl BranchProfile {
    /// Storage requirements.
    pub fn spec() -> InlinableSpec {
        InlinableSpec::new("BranchProfile").state("entered", 1)
    }

    /// Bind to fields reserved by [`BranchProfile::spec`].
    pub fn inline(target: &InlineTarget) -> DispatchResult<Self> {
        Ok(Self {
            state: target.get_state(0, 1)?,
        })
    }

    /// Mark the branch entered.
    #[inline]
    pub fn enter(&self, storage: &InlineStorage) {
        if !self.state.flag(storage, 0) {
            // A one-bit range always holds 1.
            let _ = self.state.set_flag(storage, 0);
        }
    }

    /// Whether the branch was entered.
    #[inline]
    pub fn was_entered(&self, storage: &InlineStorage) -> bool {
        self.state.flag(storage, 0)
    }
}

// =============================================================================
// Condition Profile
// =============================================================================

/// Records which outcomes a condition has produced. Two state bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionProfile {
    state: StateField,
}

impl ConditionProfile {
    const SEEN_TRUE: u32 = 0;
    const SEEN_FALSE: u32 = 1;

    /// Storage requirements.
    pub fn spec() -> InlinableSpec {
        InlinableSpec::new("ConditionProfile").state("seen", 2)
    }

    /// Bind to fields reserved by [`ConditionProfile::spec`].
    pub fn inline(target: &InlineTarget) -> DispatchResult<Self> {
        Ok(Self {
            state: target.get_state(0, 2)?,
        })
    }

    /// Record `value` and return it.
    #[inline]
    pub fn profile(&self, storage: &InlineStorage, value: bool) -> bool {
        let bit = if value { Self::SEEN_TRUE } else { Self::SEEN_FALSE };
        if !self.state.flag(storage, bit) {
            let _ = self.state.set_flag(storage, bit);
        }
        value
    }

    /// Whether `true` was ever observed.
    pub fn seen_true(&self, storage: &InlineStorage) -> bool {
        self.state.flag(storage, Self::SEEN_TRUE)
    }

    /// Whether `false` was ever observed.
    pub fn seen_false(&self, storage: &InlineStorage) -> bool {
        self.state.flag(storage, Self::SEEN_FALSE)
    }
}

// =============================================================================
// Counting Condition Profile
// =============================================================================

/// Counts outcomes of a condition in two saturating int slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountingConditionProfile {
    true_count: PrimitiveField,
    false_count: PrimitiveField,
}

impl CountingConditionProfile {
    /// Storage requirements.
    pub fn spec() -> InlinableSpec {
        InlinableSpec::new("CountingConditionProfile")
            .primitive("trueCount", PrimitiveKind::Int)
            .primitive("falseCount", PrimitiveKind::Int)
    }

    /// Bind to fields reserved by [`CountingConditionProfile::spec`].
    pub fn inline(target: &InlineTarget) -> DispatchResult<Self> {
        Ok(Self {
            true_count: target.get_primitive(0, PrimitiveKind::Int)?,
            false_count: target.get_primitive(1, PrimitiveKind::Int)?,
        })
    }

    /// Record `value` and return it.
    pub fn profile(&self, storage: &InlineStorage, value: bool) -> DispatchResult<bool> {
        let field = if value { &self.true_count } else { &self.false_count };
        field.increment_int(storage)?;
        Ok(value)
    }

    /// Observed `(true, false)` counts.
    pub fn counts(&self, storage: &InlineStorage) -> DispatchResult<(i32, i32)> {
        Ok((
            self.true_count.get_int(storage)?,
            self.false_count.get_int(storage)?,
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inlinable::RegionLayout;

    #[test]
    fn test_profiles_share_one_region() {
        let mut layout = RegionLayout::new(64);
        let branch = BranchProfile::inline(&layout.inline(&BranchProfile::spec()).unwrap()).unwrap();
        let cond =
            ConditionProfile::inline(&layout.inline(&ConditionProfile::spec()).unwrap()).unwrap();
        let counting = CountingConditionProfile::inline(
            &layout.inline(&CountingConditionProfile::spec()).unwrap(),
        )
        .unwrap();
        assert_eq!(layout.allocator().used_bits(), 3);
        let storage = layout.storage(true);

        assert!(!branch.was_entered(&storage));
        branch.enter(&storage);
        assert!(branch.was_entered(&storage));

        assert!(cond.profile(&storage, true));
        assert!(cond.seen_true(&storage));
        assert!(!cond.seen_false(&storage));
        assert!(!cond.profile(&storage, false));
        assert!(cond.seen_false(&storage));
        assert!(branch.was_entered(&storage));

        counting.profile(&storage, true).unwrap();
        counting.profile(&storage, true).unwrap();
        counting.profile(&storage, false).unwrap();
        assert_eq!(counting.counts(&storage).unwrap(), (2, 1));
    }

    #[test]
    fn test_inline_against_wrong_target() {
        let mut layout = RegionLayout::new(64);
        let target = layout.inline(&BranchProfile::spec()).unwrap();
        assert!(CountingConditionProfile::inline(&target).is_err());
        assert!(ConditionProfile::inline(&target).is_err());
    }
}
