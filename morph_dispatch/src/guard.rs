//! Guard evaluation and bind memoization.
//!
//! Guards are boolean predicates over a [`Scope`]: the (cast) arguments, the
//! cached values of the instance under test, the frame, and the
//! specialization's binds. Binds are helper values computed from the
//! arguments; a [`BindFrame`] memoizes them so each bind runs at most once per
//! dispatch attempt no matter how many guards, cache initializers or bodies
//! read it.
//!
//! # Guard Classification
//!
//! | Reads                               | Kind    | Evaluated            |
//! |-------------------------------------|---------|----------------------|
//! | args, frame, or an arg-derived bind | dynamic | every fast-path hit  |
//! | cached values / static binds only   | static  | slow path only       |
//!
//! Guards that read cached values are evaluated after cache initialization;
//! all others run before it.

use bitflags::bitflags;
use morph_core::{Frame, Value};
use smallvec::SmallVec;
use std::cell::OnceCell;
use std::fmt;
use std::sync::Arc;

static NULL: Value = Value::Null;

bitflags! {
    /// Inputs an expression reads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Reads: u8 {
        /// Dynamic arguments.
        const ARGS = 1 << 0;
        /// Cached values of the instance.
        const CACHED = 1 << 1;
        /// Bind values.
        const BINDS = 1 << 2;
        /// The invocation frame.
        const FRAME = 1 << 3;
    }
}

/// Whether an expression with the given read set depends on per-call values.
#[inline]
pub(crate) fn reads_dynamic(reads: Reads, binds: &[usize], dynamic_binds: &[bool]) -> bool {
    reads.intersects(Reads::ARGS | Reads::FRAME)
        || binds
            .iter()
            .any(|&b| dynamic_binds.get(b).copied().unwrap_or(false))
}

// =============================================================================
// Bind
// =============================================================================

/// Computes a bind from the arguments and the values of its dependencies.
pub type BindFn = Arc<dyn Fn(&[Value], &[Value]) -> Value + Send + Sync>;

/// A named helper value derived from the arguments.
#[derive(Clone)]
pub struct Bind {
    pub(crate) name: String,
    pub(crate) deps: SmallVec<[usize; 2]>,
    pub(crate) reads_args: bool,
    pub(crate) compute: BindFn,
}

impl Bind {
    /// Declare a bind reading the arguments.
    ///
    /// `compute` receives the arguments and the values of the binds declared
    /// with [`Bind::after`], in that order.
    pub fn new<F>(name: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&[Value], &[Value]) -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            deps: SmallVec::new(),
            reads_args: true,
            compute: Arc::new(compute),
        }
    }

    /// Depend on the bind at `index` of the same specialization.
    ///
    /// The dependency must be declared earlier.
    pub fn after(mut self, index: usize) -> Self {
        self.deps.push(index);
        self
    }

    /// Mark this bind as not reading the arguments directly.
    pub fn static_value(mut self) -> Self {
        self.reads_args = false;
        self
    }

    /// Bind name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dependencies.
    pub fn deps(&self) -> &[usize] {
        &self.deps
    }

    /// Whether this bind reads the arguments directly.
    pub fn reads_args(&self) -> bool {
        self.reads_args
    }
}

impl fmt::Debug for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bind")
            .field("name", &self.name)
            .field("deps", &self.deps)
            .field("reads_args", &self.reads_args)
            .finish_non_exhaustive()
    }
}

/// Per-bind dynamic flag: the bind reads arguments, directly or through an
/// earlier bind.
pub(crate) fn dynamic_binds(binds: &[Bind]) -> Vec<bool> {
    let mut out: Vec<bool> = Vec::with_capacity(binds.len());
    for bind in binds {
        let dynamic = bind.reads_args
            || bind
                .deps
                .iter()
                .any(|&d| out.get(d).copied().unwrap_or(false));
        out.push(dynamic);
    }
    out
}

// =============================================================================
// Guard
// =============================================================================

/// A guard predicate.
pub type GuardFn = Arc<dyn Fn(&Scope<'_>) -> bool + Send + Sync>;

/// A named guard.
#[derive(Clone)]
pub struct Guard {
    pub(crate) name: String,
    pub(crate) reads: Reads,
    pub(crate) binds: SmallVec<[usize; 2]>,
    test: GuardFn,
}

impl Guard {
    /// Declare a guard reading the arguments.
    pub fn new<F>(name: impl Into<String>, test: F) -> Self
    where
        F: Fn(&Scope<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            reads: Reads::ARGS,
            binds: SmallVec::new(),
            test: Arc::new(test),
        }
    }

    /// Replace the read set.
    pub fn reads(mut self, reads: Reads) -> Self {
        self.reads = reads;
        self
    }

    /// Read the bind at `index`.
    pub fn bind(mut self, index: usize) -> Self {
        self.binds.push(index);
        self.reads |= Reads::BINDS;
        self
    }

    /// Guard name, usually its source expression.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared read set.
    pub fn read_set(&self) -> Reads {
        self.reads
    }

    #[inline]
    pub(crate) fn test(&self, scope: &Scope<'_>) -> bool {
        (self.test)(scope)
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("name", &self.name)
            .field("reads", &self.reads)
            .field("binds", &self.binds)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Bind Frame
// =============================================================================

/// Memoized bind values of one dispatch attempt.
///
/// Every specialization of a table owns a contiguous run of slots starting at
/// its bind base.
pub struct BindFrame {
    slots: SmallVec<[OnceCell<Value>; 8]>,
}

impl BindFrame {
    /// Frame with `len` unevaluated slots.
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| OnceCell::new()).collect(),
        }
    }

    /// Number of binds evaluated so far.
    pub fn evaluated(&self) -> usize {
        self.slots.iter().filter(|s| s.get().is_some()).count()
    }

    fn resolve(&self, base: usize, decls: &[Bind], index: usize, args: &[Value]) -> Value {
        let (Some(slot), Some(decl)) = (self.slots.get(base + index), decls.get(index)) else {
            return Value::Null;
        };
        slot.get_or_init(|| {
            let deps: SmallVec<[Value; 4]> = decl
                .deps
                .iter()
                .map(|&d| {
                    if d < index {
                        self.resolve(base, decls, d, args)
                    } else {
                        Value::Null
                    }
                })
                .collect();
            (decl.compute)(args, &deps)
        })
        .clone()
    }
}

impl fmt::Debug for BindFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindFrame")
            .field("slots", &self.slots.len())
            .field("evaluated", &self.evaluated())
            .finish()
    }
}

// =============================================================================
// Scope
// =============================================================================

/// Everything a guard, cache initializer or assumption expression may read.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    args: &'a [Value],
    cached: &'a [Value],
    frame: Option<&'a Frame>,
    binds: &'a BindFrame,
    bind_base: usize,
    bind_decls: &'a [Bind],
}

impl<'a> Scope<'a> {
    pub(crate) fn new(
        args: &'a [Value],
        frame: Option<&'a Frame>,
        binds: &'a BindFrame,
        bind_base: usize,
        bind_decls: &'a [Bind],
    ) -> Self {
        Self {
            args,
            cached: &[],
            frame,
            binds,
            bind_base,
            bind_decls,
        }
    }

    /// Same scope seeing `cached` as the instance's cached values.
    #[inline]
    pub(crate) fn with_cached(self, cached: &'a [Value]) -> Self {
        Self { cached, ..self }
    }

    /// Argument `index`, or `Null` if absent.
    #[inline]
    pub fn arg(&self, index: usize) -> &'a Value {
        self.args.get(index).unwrap_or(&NULL)
    }

    /// All arguments, after implicit casts.
    #[inline]
    pub fn args(&self) -> &'a [Value] {
        self.args
    }

    /// Cached value `index`, or `Null` if absent.
    #[inline]
    pub fn cached(&self, index: usize) -> &'a Value {
        self.cached.get(index).unwrap_or(&NULL)
    }

    /// Cached values visible to this scope.
    #[inline]
    pub fn cached_values(&self) -> &'a [Value] {
        self.cached
    }

    /// Value of bind `index`, computing it on first use in this attempt.
    #[inline]
    pub fn bind(&self, index: usize) -> Value {
        self.binds
            .resolve(self.bind_base, self.bind_decls, index, self.args)
    }

    /// Invocation frame, if the call carried one.
    #[inline]
    pub fn frame(&self) -> Option<&'a Frame> {
        self.frame
    }
}

impl fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("args", &self.args)
            .field("cached", &self.cached)
            .field("frame", &self.frame.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
