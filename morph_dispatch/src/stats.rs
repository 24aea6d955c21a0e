//! Dispatch statistics.
//!
//! Per-node counters of how calls were resolved. Used by tests and
//! introspection to observe specialization behavior; counters are relaxed
//! atomics and never influence dispatch.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of one dispatch node.
#[derive(Debug, Default)]
pub struct DispatchStats {
    fast_hits: AtomicU64,
    slow_paths: AtomicU64,
    instances_created: AtomicU64,
    instances_removed: AtomicU64,
    exclusions: AtomicU64,
    rewrites: AtomicU64,
    respecializations: AtomicU64,
    unsupported: AtomicU64,
    polymorphic_transitions: AtomicU64,
    megamorphic_activations: AtomicU64,
}

impl DispatchStats {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_fast_hit(&self) {
        self.fast_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_slow_path(&self) {
        self.slow_paths.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_created(&self) {
        self.instances_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_removed(&self, count: usize) {
        self.instances_removed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_exclusion(&self) {
        self.exclusions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_rewrite(&self) {
        self.rewrites.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_respecialization(&self) {
        self.respecializations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_unsupported(&self) {
        self.unsupported.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_polymorphic(&self) {
        self.polymorphic_transitions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_megamorphic(&self) {
        self.megamorphic_activations.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            fast_hits: self.fast_hits.load(Ordering::Relaxed),
            slow_paths: self.slow_paths.load(Ordering::Relaxed),
            instances_created: self.instances_created.load(Ordering::Relaxed),
            instances_removed: self.instances_removed.load(Ordering::Relaxed),
            exclusions: self.exclusions.load(Ordering::Relaxed),
            rewrites: self.rewrites.load(Ordering::Relaxed),
            respecializations: self.respecializations.load(Ordering::Relaxed),
            unsupported: self.unsupported.load(Ordering::Relaxed),
            polymorphic_transitions: self.polymorphic_transitions.load(Ordering::Relaxed),
            megamorphic_activations: self.megamorphic_activations.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.fast_hits.store(0, Ordering::Relaxed);
        self.slow_paths.store(0, Ordering::Relaxed);
        self.instances_created.store(0, Ordering::Relaxed);
        self.instances_removed.store(0, Ordering::Relaxed);
        self.exclusions.store(0, Ordering::Relaxed);
        self.rewrites.store(0, Ordering::Relaxed);
        self.respecializations.store(0, Ordering::Relaxed);
        self.unsupported.store(0, Ordering::Relaxed);
        self.polymorphic_transitions.store(0, Ordering::Relaxed);
        self.megamorphic_activations.store(0, Ordering::Relaxed);
    }
}

/// Plain copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    /// Calls served by an existing instance.
    pub fast_hits: u64,
    /// Calls that took the specialization lock.
    pub slow_paths: u64,
    /// Instances published.
    pub instances_created: u64,
    /// Instances removed by exclusion, invalidation or reset.
    pub instances_removed: u64,
    /// Specializations excluded.
    pub exclusions: u64,
    /// Rewrites after a `rewrite_on` exception.
    pub rewrites: u64,
    /// Slow-path entries caused by an instance with invalid assumptions.
    pub respecializations: u64,
    /// Calls no specialization accepted.
    pub unsupported: u64,
    /// Monomorphic to polymorphic transitions.
    pub polymorphic_transitions: u64,
    /// Activations of megamorphic specializations.
    pub megamorphic_activations: u64,
}

impl DispatchStatsSnapshot {
    /// Total calls observed.
    pub fn calls(&self) -> u64 {
        self.fast_hits + self.slow_paths
    }

    /// Fraction of calls served by the fast path.
    pub fn hit_rate(&self) -> f64 {
        let calls = self.calls();
        if calls == 0 {
            0.0
        } else {
            self.fast_hits as f64 / calls as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = DispatchStats::new();
        stats.record_fast_hit();
        stats.record_fast_hit();
        stats.record_fast_hit();
        stats.record_slow_path();
        stats.record_removed(2);
        stats.record_polymorphic();

        let snap = stats.snapshot();
        assert_eq!(snap.calls(), 4);
        assert_eq!(snap.instances_removed, 2);
        assert_eq!(snap.polymorphic_transitions, 1);
        assert!((snap.hit_rate() - 0.75).abs() < f64::EPSILON);

        stats.reset();
        assert_eq!(stats.snapshot(), DispatchStatsSnapshot::default());
        assert_eq!(DispatchStatsSnapshot::default().hit_rate(), 0.0);
    }
}
