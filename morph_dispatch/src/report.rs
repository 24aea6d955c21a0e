//! Polymorphism reporting.
//!
//! A table can carry a listener that is told when one of its nodes stops
//! being monomorphic, or activates a specialization marked
//! [`Specialization::megamorphic`](crate::Specialization::megamorphic).
//! Embedders use this to decide when a call site is worth splitting.
//!
//! Reports are issued from the slow path while the node lock is held, so a
//! listener must not execute the reporting node.

use morph_core::NodeId;
use std::fmt;
use std::sync::Arc;

/// Why a node was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolymorphismKind {
    /// The node went from one instance to several.
    Polymorphic,
    /// A megamorphic specialization was activated.
    Megamorphic,
}

impl PolymorphismKind {
    /// Lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            PolymorphismKind::Polymorphic => "polymorphic",
            PolymorphismKind::Megamorphic => "megamorphic",
        }
    }
}

impl fmt::Display for PolymorphismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One report.
#[derive(Debug, Clone, Copy)]
pub struct PolymorphismReport<'a> {
    /// Reporting node.
    pub node: NodeId,
    /// Table name.
    pub table: &'a str,
    /// Specialization whose activation triggered the report.
    pub specialization: &'a str,
    /// Kind of report.
    pub kind: PolymorphismKind,
    /// Live instances after the activation.
    pub instances: usize,
}

/// Type alias for polymorphism listeners.
pub type PolymorphismListener = Arc<dyn Fn(&PolymorphismReport<'_>) + Send + Sync>;

/// Optional listener attached to a table.
#[derive(Clone, Default)]
pub struct PolymorphismHook {
    listener: Option<PolymorphismListener>,
    enabled: bool,
}

impl PolymorphismHook {
    /// Hook without a listener.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&mut self, listener: PolymorphismListener) {
        self.listener = Some(listener);
        self.enabled = true;
    }

    /// A table with a single specialization limited to one instance can
    /// never become polymorphic.
    pub(crate) fn disable_if_monomorphic(&mut self, specializations: usize, first_limit: usize) {
        if specializations == 1 && first_limit == 1 {
            self.enabled = false;
        }
    }

    /// Whether reports reach a listener.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.listener.is_some()
    }

    pub(crate) fn report(&self, report: &PolymorphismReport<'_>) {
        if !self.enabled {
            return;
        }
        if let Some(listener) = &self.listener {
            listener(report);
        }
    }
}

impl fmt::Debug for PolymorphismHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolymorphismHook")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn report(kind: PolymorphismKind) -> PolymorphismReport<'static> {
        PolymorphismReport {
            node: NodeId(1),
            table: "t",
            specialization: "s",
            kind,
            instances: 2,
        }
    }

    #[test]
    fn test_hook_dispatch() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let mut hook = PolymorphismHook::new();
        assert!(!hook.is_enabled());
        hook.report(&report(PolymorphismKind::Polymorphic));

        hook.set(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(hook.is_enabled());
        hook.report(&report(PolymorphismKind::Megamorphic));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        hook.disable_if_monomorphic(1, 1);
        assert!(!hook.is_enabled());
        hook.report(&report(PolymorphismKind::Polymorphic));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(PolymorphismKind::Megamorphic.to_string(), "megamorphic");
    }
}
