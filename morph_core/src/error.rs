//! Error taxonomy.
//!
//! - [`ConfigError`]: the dispatch table (or an inline layout) is invalid.
//!   Fatal; never downgraded to a retry.
//! - [`DispatchError`]: everything `execute` can return. Only
//!   [`DispatchError::Unsupported`] is a routine, caller-handled condition.
//! - [`Throw`]: what a specialization body may raise. Guest exceptions listed
//!   in the specialization's `rewrite_on` set never reach the caller.

use crate::NodeId;
use crate::value::Value;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type DispatchResult<T> = Result<T, DispatchError>;

// =============================================================================
// Configuration Errors
// =============================================================================

/// A setup-time error describing an invalid specialization table or layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Two specializations share a name.
    #[error("specialization '{name}' is declared more than once in '{table}'")]
    DuplicateSpecialization {
        /// Table name.
        table: String,
        /// Duplicated specialization name.
        name: String,
    },

    /// A `replaces` entry names no specialization.
    #[error("specialization '{specialization}' replaces unknown specialization '{target}'")]
    UnknownReplaceTarget {
        /// Replacing specialization.
        specialization: String,
        /// Missing target.
        target: String,
    },

    /// A `replaces` entry names a later-declared specialization.
    #[error(
        "specialization '{specialization}' replaces '{target}', which must be declared before it"
    )]
    ReplacesForwardReference {
        /// Replacing specialization.
        specialization: String,
        /// Target declared too late.
        target: String,
    },

    /// The `replaces` edges form a cycle.
    #[error("replaces cycle: {}", path.join(" -> "))]
    ReplacesCycle {
        /// Specializations along the cycle.
        path: Vec<String>,
    },

    /// More than one fallback specialization.
    #[error("table '{table}' declares more than one fallback ('{first}' and '{second}')")]
    MultipleFallbacks {
        /// Table name.
        table: String,
        /// First fallback.
        first: String,
        /// Second fallback.
        second: String,
    },

    /// A `rewrite_on` specialization without any specialization to fall back to.
    #[error(
        "specialization '{specialization}' declares rewrite_on but no specialization replaces it"
    )]
    RewriteWithoutReplacement {
        /// Offending specialization.
        specialization: String,
    },

    /// A parameter type list does not match the table arity.
    #[error("specialization '{specialization}' declares {actual} parameter types, expected {expected}")]
    ParamCountMismatch {
        /// Offending specialization.
        specialization: String,
        /// Table arity.
        expected: usize,
        /// Declared parameter types.
        actual: usize,
    },

    /// A shared cache group violates the sharing rules.
    #[error("illegal sharing group '{group}': {reason}")]
    IllegalSharingGroup {
        /// Group name.
        group: String,
        /// Why the group is rejected.
        reason: String,
    },

    /// A bind expression references itself or a later bind.
    #[error("bind '{bind}' of specialization '{specialization}' references '{references}' before it is bound")]
    BindForwardReference {
        /// Owning specialization.
        specialization: String,
        /// Offending bind.
        bind: String,
        /// The not-yet-bound reference.
        references: String,
    },

    /// A static-only expression reads a dynamic value.
    #[error("expression '{expression}' of specialization '{specialization}' binds a dynamic value where only cached or static values are allowed")]
    DynamicBindInStaticContext {
        /// Owning specialization.
        specialization: String,
        /// Offending expression.
        expression: String,
    },

    /// Claimed bits exceed the region capacity.
    #[error("bit width overflow: {requested} bits requested, region capacity is {capacity}")]
    BitWidthOverflow {
        /// Total bits after the failing claim.
        requested: u32,
        /// Region capacity.
        capacity: u32,
    },

    /// Two fixed claims overlap.
    #[error("bit claim '{name}' overlaps '{other}'")]
    OverlappingBits {
        /// New claim.
        name: String,
        /// Existing claim.
        other: String,
    },

    /// A bit range is malformed.
    #[error("invalid bit range (offset {offset}, length {len}): {reason}")]
    InvalidBitRange {
        /// Requested offset.
        offset: u32,
        /// Requested length.
        len: u32,
        /// Detail.
        reason: &'static str,
    },

    /// A masked write would drop bits of the provided value.
    #[error("bits lost in masked state update: provided {provided:#x}, written {written:#x}")]
    BitsLost {
        /// Value given to the write.
        provided: u64,
        /// Value that would actually be stored.
        written: u64,
    },

    /// An inlinable node type declares private state.
    #[error("inlinable node '{node_type}' declares instance field '{field}'")]
    InstanceFieldOnInlinable {
        /// Inlinable type.
        node_type: String,
        /// Field name.
        field: String,
    },

    /// AOT preparation recursively requires itself.
    #[error("AOT preparation of '{node}' recursively requires itself")]
    AotRecursion {
        /// Node (or node type) on the preparation stack.
        node: String,
    },
}

// =============================================================================
// Unsupported Specialization
// =============================================================================

/// No specialization (including the fallback) accepts the arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedSpecialization {
    /// Node that rejected the arguments.
    pub node: NodeId,
    /// Table name of that node.
    pub node_name: String,
    /// Argument values, after no cast applied.
    pub args: Vec<Value>,
}

impl fmt::Display for UnsupportedSpecialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsupported specialization in '{}' {} for arguments (",
            self.node_name, self.node
        )?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}: {}", arg, arg.value_type())?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for UnsupportedSpecialization {}

// =============================================================================
// Guest Exceptions
// =============================================================================

/// An exception raised by a specialization body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct GuestException {
    /// Exception kind, matched against `rewrite_on` sets.
    pub kind: &'static str,
    /// Detail message.
    pub message: String,
}

impl GuestException {
    /// Create an exception.
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Dispatch Errors
// =============================================================================

/// Any failure of an `execute` call.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// No specialization matched after the full table was evaluated.
    #[error(transparent)]
    Unsupported(#[from] UnsupportedSpecialization),

    /// The table or a layout is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Slow-path specialization re-entered on the same thread.
    #[error("recursive specialization of node {node} ('{name}') detected")]
    RecursiveSpecialization {
        /// Node being specialized.
        node: NodeId,
        /// Table name.
        name: String,
    },

    /// A never-default cache initializer produced the default value.
    #[error("A specialization cache returned a default value. The cache initializer must never return a default value for this cache. (specialization '{specialization}', cache '{cache}')")]
    NeverDefault {
        /// Owning specialization.
        specialization: String,
        /// Cache parameter.
        cache: String,
    },

    /// An uncached node was asked to adopt children.
    #[error("uncached node '{table}' cannot adopt child '{child}'")]
    UncachedAdoption {
        /// Table name.
        table: String,
        /// Child that required adoption.
        child: String,
    },

    /// Inline field or value access with the wrong type or index.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected kind.
        expected: String,
        /// Actual kind.
        actual: String,
    },

    /// Wrong number of arguments.
    #[error("node {node} ('{name}') expects {expected} arguments, got {actual}")]
    ArityMismatch {
        /// Node.
        node: NodeId,
        /// Table name.
        name: String,
        /// Table arity.
        expected: usize,
        /// Given arguments.
        actual: usize,
    },

    /// Rewrites kept failing past the configured retry bound.
    #[error("node {node} ('{name}') exceeded {retries} rewrite retries")]
    RewriteLimit {
        /// Node.
        node: NodeId,
        /// Table name.
        name: String,
        /// Retry bound.
        retries: u32,
    },

    /// A body raised an exception not covered by `rewrite_on`.
    #[error(transparent)]
    Exception(#[from] GuestException),
}

impl DispatchError {
    /// Whether this is the routine "no specialization matched" condition.
    #[inline]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, DispatchError::Unsupported(_))
    }

    /// Whether this error indicates an invalid table rather than a data condition.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::Config(_)
                | DispatchError::RecursiveSpecialization { .. }
                | DispatchError::NeverDefault { .. }
                | DispatchError::UncachedAdoption { .. }
        )
    }
}

// =============================================================================
// Throw
// =============================================================================

/// Abnormal completion of a specialization body.
#[derive(Debug, Clone)]
pub enum Throw {
    /// Guest exception; triggers a rewrite if its kind is in `rewrite_on`.
    Exception(GuestException),
    /// Engine error from a nested dispatch; always propagated.
    Error(DispatchError),
}

impl Throw {
    /// Convenience constructor for guest exceptions.
    pub fn exception(kind: &'static str, message: impl Into<String>) -> Self {
        Throw::Exception(GuestException::new(kind, message))
    }
}

impl From<DispatchError> for Throw {
    fn from(e: DispatchError) -> Self {
        Throw::Error(e)
    }
}

impl From<GuestException> for Throw {
    fn from(e: GuestException) -> Self {
        Throw::Exception(e)
    }
}

impl From<ConfigError> for Throw {
    fn from(e: ConfigError) -> Self {
        Throw::Error(DispatchError::Config(e))
    }
}

impl From<Throw> for DispatchError {
    fn from(t: Throw) -> Self {
        match t {
            Throw::Exception(e) => DispatchError::Exception(e),
            Throw::Error(e) => e,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_message_lists_values_and_types() {
        let err = UnsupportedSpecialization {
            node: NodeId(4),
            node_name: "Add".into(),
            args: vec![Value::Int(1), Value::str("x")],
        };
        let msg = err.to_string();
        assert!(msg.contains("'Add'"));
        assert!(msg.contains("#4"));
        assert!(msg.contains("1: int"));
        assert!(msg.contains("\"x\": str"));
    }

    #[test]
    fn test_replaces_cycle_message() {
        let err = ConfigError::ReplacesCycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "replaces cycle: a -> b -> a");
    }

    #[test]
    fn test_throw_round_trip_into_dispatch_error() {
        let t = Throw::exception("ArithmeticException", "overflow");
        let e: DispatchError = t.into();
        assert!(matches!(e, DispatchError::Exception(ref g) if g.kind == "ArithmeticException"));
        assert!(!e.is_fatal());
        assert!(!e.is_unsupported());
    }

    #[test]
    fn test_fatal_classification() {
        let e = DispatchError::from(ConfigError::AotRecursion { node: "n".into() });
        assert!(e.is_fatal());
        let e = DispatchError::NeverDefault {
            specialization: "s0".into(),
            cache: "c".into(),
        };
        assert!(e.is_fatal());
        assert!(e.to_string().starts_with("A specialization cache returned a default value"));
    }
}
