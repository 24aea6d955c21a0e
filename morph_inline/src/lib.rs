//! Morph Inline Field Packer
//!
//! Packs per-call-site dispatch state and small inlined caches into
//! fixed-width atomic storage owned by a parent node, instead of allocating
//! a separate child object for every cache.
//!
//! # Architecture
//!
//! ```text
//!   setup time                               run time
//!  ┌────────────────────┐                 ┌──────────────────────────────┐
//!  │ RegionLayout       │                 │ InlineStorage                │
//!  │  BitAllocator ─────┼── BitRange ───▶ │  words:  [AtomicU64; n]      │
//!  │  InlinableSpec ────┼── InlineTarget ▶│  prims:  [AtomicU64; m]      │
//!  └────────────────────┘                 │  refs:   [RwLock<Option<..>>]│
//!                                         └──────────────────────────────┘
//! ```
//!
//! - [`BitAllocator`] claims contiguous, non-overlapping ranges that never
//!   straddle a 64-bit word and tracks the storage width the region needs.
//! - [`InlineStorage`] performs masked read-modify-write updates with
//!   compare-exchange loops, so a write never clobbers foreign bits.
//! - [`InlineTarget`] hands typed field descriptors to an inlined node and
//!   rejects mismatched requests.
//! - [`profile`] provides the inlined profiles dispatch bodies use.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod bits;
pub mod field;
pub mod inlinable;
pub mod profile;
pub mod storage;
pub mod target;

pub use allocator::{BitAllocator, BitClaim};
pub use bits::{BitRange, StorageWidth, WORD_BITS};
pub use field::{InlinableField, PrimitiveField, PrimitiveKind, ReferenceField, StateField};
pub use inlinable::{InlinableSpec, RegionLayout, ReferenceSpec};
pub use profile::{BranchProfile, ConditionProfile, CountingConditionProfile};
pub use storage::InlineStorage;
pub use target::InlineTarget;
