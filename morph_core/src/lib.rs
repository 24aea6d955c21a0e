//! Morph Core
//!
//! Shared foundation for the morph self-specializing dispatch engine:
//!
//! - [`Value`] / [`ValueType`]: the dynamic argument representation every
//!   specialization guard, cache initializer and body operates on.
//! - [`Frame`]: optional per-invocation context passed through `execute`.
//! - [`ConfigError`] / [`DispatchError`]: the error taxonomy. Configuration
//!   errors are fatal and describe an invalid dispatch table; only
//!   [`UnsupportedSpecialization`] is expected to be handled routinely.
//! - [`DispatchConfig`]: tunables shared by every node built from a table.
//! - [`logging`]: `tracing` subscriber bootstrap.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod value;

pub use config::DispatchConfig;
pub use error::{
    ConfigError, DispatchError, DispatchResult, GuestException, Throw, UnsupportedSpecialization,
};
pub use frame::Frame;
pub use value::{ObjectRef, Value, ValueType};

/// Identity of a dispatch node inside a node arena.
///
/// Ids are never reused within one arena, so they are stable for error
/// reports and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Sentinel for nodes that do not live in an arena (uncached singletons).
    pub const DETACHED: NodeId = NodeId(u32::MAX);

    /// Raw index.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Whether this is the detached sentinel.
    #[inline]
    pub const fn is_detached(self) -> bool {
        self.0 == u32::MAX
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_detached() {
            write!(f, "#detached")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}
