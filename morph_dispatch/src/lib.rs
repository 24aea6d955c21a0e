//! Morph Specialization Dispatch Engine
//!
//! Self-specializing call-site nodes: a node owns a table of guarded
//! implementation variants ("specializations") and learns, per call site,
//! which of them apply. Seen variants are cached as instances that later
//! calls reach through a lock-free fast path.
//!
//! # Architecture
//!
//! ```text
//!                 execute(args)
//!                      │
//!          ┌───────────▼────────────┐   hit    ┌──────────────────┐
//!          │ fast path              ├─────────▶│ specialization   │
//!          │  snapshot walk         │          │ body (no lock)   │
//!          │  active bit, guards,   │          └────────┬─────────┘
//!          │  assumptions           │                   │ rewrite_on
//!          └───────────┬────────────┘                   ▼
//!                      │ miss / stale           exclude + retry
//!          ┌───────────▼────────────┐
//!          │ slow path (node lock)  │  purge ─ double-check ─ table walk
//!          │  casts, guards, limit, │  ─ cache init ─ children ─ publish
//!          │  caches, assumptions   │  ─ state bits ─ replaces exclusion
//!          └────────────────────────┘
//! ```
//!
//! # Dispatch States
//!
//! | State           | Meaning                                         |
//! |-----------------|-------------------------------------------------|
//! | `Uninitialized` | No specialization activated yet                 |
//! | `Monomorphic`   | Exactly one cached instance                     |
//! | `Polymorphic`   | Two or more cached instances                    |
//! | `Generic`       | A replacing, cache-free specialization is active|
//!
//! # Modules
//!
//! - [`guard`]: guards, binds and per-attempt bind memoization
//! - [`assumption`]: one-way invalidatable assumptions and their registry
//! - [`cache`]: cache instances and the snapshot-published slot store
//! - [`specialization`] / [`table`]: declarations and the validated table
//! - [`node`]: the cached dispatch node
//! - [`uncached`]: the stateless variant
//! - [`arena`]: node ownership and adoption
//! - [`introspect`], [`aot`], [`stats`], [`report`]: tooling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aot;
pub mod arena;
pub mod assumption;
mod attempt;
pub mod cache;
pub mod guard;
pub mod introspect;
pub mod lock;
pub mod node;
pub mod report;
pub mod specialization;
pub mod stats;
pub mod table;
pub mod uncached;

pub use aot::prepare_for_aot;
pub use arena::{ArenaEntry, NodeArena};
pub use assumption::{
    Assumption, AssumptionExpr, AssumptionRegistry, AssumptionSet, InvalidationEvent,
};
pub use cache::{CacheInstance, CacheParam, CacheSlotStore, InsertOutcome};
pub use guard::{Bind, Guard, Reads, Scope};
pub use introspect::{Introspectable, SpecializationInfo};
pub use lock::SpecializationLock;
pub use node::{DispatchNode, DispatchState, Executable};
pub use report::{PolymorphismHook, PolymorphismKind, PolymorphismListener, PolymorphismReport};
pub use specialization::{ChildSpec, ProfileKind, Specialization, SpecializationCall};
pub use stats::{DispatchStats, DispatchStatsSnapshot};
pub use table::{ImplicitCast, SpecializationTable, TableBuilder};
pub use uncached::UncachedNode;

pub use morph_core::{
    ConfigError, DispatchConfig, DispatchError, DispatchResult, Frame, GuestException, NodeId,
    Throw, Value, ValueType,
};
