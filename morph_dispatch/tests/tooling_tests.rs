//! Tests for node tooling.
//!
//! Coverage:
//! - Child creation, adoption and release through the node arena
//! - Recursive specialization detection
//! - Introspection of active, excluded and cached state
//! - AOT preparation, including recursion rejection
//! - Uncached execution of shared tables
//! - Polymorphism reports

use morph_dispatch::{
    CacheParam, ChildSpec, ConfigError, DispatchConfig, DispatchError, DispatchNode,
    DispatchState, Guard, Introspectable, NodeArena, PolymorphismKind, Reads, Specialization,
    SpecializationTable, UncachedNode, Value, ValueType, prepare_for_aot,
};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};

fn leaf(value: i32) -> Arc<SpecializationTable> {
    SpecializationTable::builder("Leaf", 0)
        .specialization(Specialization::new("const", move |_| Ok(Value::Int(value))))
        .build(DispatchConfig::default())
        .unwrap()
}

fn parent_table() -> Arc<SpecializationTable> {
    let adopted = leaf(1);
    let detached = leaf(2);
    SpecializationTable::builder("Parent", 0)
        .specialization(
            Specialization::new("sum", |c| {
                let a = c.execute_child(0, &[])?.as_int().unwrap_or(0);
                let b = c.execute_child(1, &[])?.as_int().unwrap_or(0);
                Ok(Value::Int(a + b))
            })
            .child(ChildSpec::new("adopted", move || adopted.clone()))
            .child(ChildSpec::new("detached", move || detached.clone()).detached()),
        )
        .build(DispatchConfig::default())
        .unwrap()
}

// =============================================================================
// Children And Arena
// =============================================================================

mod arena_tests {
    use super::*;

    #[test]
    fn test_children_created_with_instance() {
        let arena = NodeArena::shared();
        let parent = DispatchNode::new(parent_table(), &arena);
        assert_eq!(parent.execute(&[]).unwrap(), Value::Int(3));

        let instances = parent.instances();
        let children = instances[0].children();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].parent(), Some(parent.id()));
        assert_eq!(children[1].parent(), None);
        assert_eq!(arena.children_of(parent.id()).as_slice(), &[children[0].id()]);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_reset_releases_children() {
        let arena = NodeArena::shared();
        let parent = DispatchNode::new(parent_table(), &arena);
        parent.execute(&[]).unwrap();
        parent.reset().unwrap();
        assert_eq!(arena.len(), 1);
        assert!(arena.children_of(parent.id()).is_empty());

        drop(parent);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_manual_adoption() {
        let arena = NodeArena::shared();
        let a = DispatchNode::new(leaf(1), &arena);
        let b = DispatchNode::new(leaf(2), &arena);
        assert!(a.adopt(&b));
        assert_eq!(b.parent(), Some(a.id()));
        assert!(!b.adopt(&a));
        assert_eq!(arena.get(b.id()).map(|n| n.id()), Some(b.id()));
    }
}

// =============================================================================
// Recursion
// =============================================================================

mod recursion_tests {
    use super::*;

    #[test]
    fn test_reentrant_specialization_reported() {
        let slot: Arc<OnceLock<Weak<DispatchNode>>> = Arc::new(OnceLock::new());
        let inner = slot.clone();
        let table = SpecializationTable::builder("SelfRef", 0)
            .specialization(
                Specialization::new("s", |c| Ok(c.cached(0).clone())).cache(
                    CacheParam::new("me", "self()", move |_| {
                        let node = inner.get().and_then(Weak::upgrade).unwrap();
                        Ok(node.execute(&[])?)
                    })
                    .reads(Reads::empty()),
                ),
            )
            .build(DispatchConfig::default())
            .unwrap();
        let node = DispatchNode::new(table, &NodeArena::shared());
        slot.set(Arc::downgrade(&node)).unwrap();

        let err = node.execute(&[]).unwrap_err();
        assert!(matches!(err, DispatchError::RecursiveSpecialization { node: id, .. } if id == node.id()));
        assert!(err.is_fatal());
        // Reported again rather than deadlocking.
        assert!(matches!(
            node.execute(&[]).unwrap_err(),
            DispatchError::RecursiveSpecialization { .. }
        ));
    }
}

// =============================================================================
// Introspection
// =============================================================================

mod introspection_tests {
    use super::*;

    fn table() -> Arc<SpecializationTable> {
        SpecializationTable::builder("Cached", 1)
            .specialization(
                Specialization::new("keyed", |c| Ok(c.cached(1).clone()))
                    .typed([ValueType::Int])
                    .cache(CacheParam::new("key", "v", |s| Ok(s.arg(0).clone())))
                    .cache(CacheParam::new("square", "key * key", |s| {
                        let k = s.cached(0).as_int().unwrap_or(0);
                        Ok(Value::Int(k * k))
                    }))
                    .guard(
                        Guard::new("v == key", |s| s.arg(0) == s.cached(0))
                            .reads(Reads::ARGS | Reads::CACHED),
                    )
                    .limit(2)
                    .unroll(1),
            )
            .specialization(
                Specialization::new("generic", |c| {
                    let k = c.arg(0).as_int().unwrap_or(0);
                    Ok(Value::Int(k * k))
                })
                .replaces("keyed"),
            )
            .build(DispatchConfig::default())
            .unwrap()
    }

    #[test]
    fn test_cached_data_lists_cache_parameters() {
        let node = DispatchNode::new(table(), &NodeArena::shared());
        node.execute(&[Value::Int(2)]).unwrap();
        node.execute(&[Value::Int(3)]).unwrap();

        let info = node.specializations();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].name, "keyed");
        assert!(info[0].active);
        assert!(!info[0].excluded);
        assert_eq!(info[0].instance_count, 2);
        assert_eq!(info[0].unrolled, 1);
        assert_eq!(
            info[0].cached_data,
            vec![
                vec![("key".to_string(), Value::Int(2)), ("square".to_string(), Value::Int(4))],
                vec![("key".to_string(), Value::Int(3)), ("square".to_string(), Value::Int(9))],
            ]
        );
        assert!(!info[1].active);
        assert_eq!(Introspectable::dispatch_state(node.as_ref()), DispatchState::Polymorphic);
    }

    #[test]
    fn test_replacement_visible() {
        let node = DispatchNode::new(table(), &NodeArena::shared());
        for v in [1, 2, 3] {
            node.execute(&[Value::Int(v)]).unwrap();
        }
        let keyed = node.specialization("keyed").unwrap();
        assert!(keyed.excluded);
        assert!(!keyed.active);
        assert!(keyed.cached_data.is_empty());
        let generic = node.specialization("generic").unwrap();
        assert!(generic.active);
        assert_eq!(generic.instance_count, 1);
    }

    #[test]
    fn test_uncached_reports_nothing_active() {
        let node = UncachedNode::new(table());
        node.execute(&[Value::Int(2)]).unwrap();
        assert!(node.specializations().iter().all(|s| !s.active && s.instance_count == 0));
        assert_eq!(node.dispatch_state(), DispatchState::Generic);
    }
}

// =============================================================================
// AOT Preparation
// =============================================================================

mod aot_tests {
    use super::*;

    #[test]
    fn test_static_specializations_activated() {
        let adopted = leaf(7);
        let table = SpecializationTable::builder("Root", 1)
            .specialization(
                Specialization::new("static", |c| c.execute_child(0, &[]))
                    .cache(
                        CacheParam::new("config", "config()", |_| Ok(Value::str("cfg")))
                            .reads(Reads::empty()),
                    )
                    .child(ChildSpec::new("leaf", move || adopted.clone())),
            )
            .specialization(
                Specialization::new("keyed", |c| Ok(c.cached(0).clone()))
                    .cache(CacheParam::new("key", "v", |s| Ok(s.arg(0).clone()))),
            )
            .build(DispatchConfig::default())
            .unwrap();
        let arena = NodeArena::shared();
        let root = DispatchNode::new(table, &arena);

        assert_eq!(prepare_for_aot(&root).unwrap(), 2);
        assert!(root.is_active(0));
        assert!(!root.is_active(1));
        let instances = root.instances();
        assert_eq!(instances[0].cached(), &[Value::str("cfg")]);
        let child = &instances[0].children()[0];
        assert!(child.is_active(0));
        assert_eq!(child.parent(), Some(root.id()));

        // Preparing again is idempotent.
        assert_eq!(prepare_for_aot(&root).unwrap(), 2);
        assert_eq!(root.instances().len(), 1);
        assert_eq!(root.execute(&[Value::Null]).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_recursive_preparation_rejected() {
        let slot: Arc<OnceLock<Arc<SpecializationTable>>> = Arc::new(OnceLock::new());
        let inner = slot.clone();
        let table = SpecializationTable::builder("Tree", 0)
            .specialization(
                Specialization::new("node", |_| Ok(Value::Null))
                    .child(ChildSpec::new("subtree", move || inner.get().unwrap().clone())),
            )
            .build(DispatchConfig::default())
            .unwrap();
        slot.set(table.clone()).unwrap();

        let root = DispatchNode::new(table, &NodeArena::shared());
        let err = prepare_for_aot(&root).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Config(ConfigError::AotRecursion { ref node }) if node == "Tree"
        ));
    }
}

// =============================================================================
// Polymorphism Reports
// =============================================================================

mod polymorphism_tests {
    use super::*;

    type Reports = Arc<Mutex<Vec<(PolymorphismKind, String, usize)>>>;

    fn table(reports: &Reports) -> Arc<SpecializationTable> {
        let sink = reports.clone();
        SpecializationTable::builder("Reported", 1)
            .specialization(
                Specialization::new("keyed", |c| Ok(c.cached(0).clone()))
                    .typed([ValueType::Int])
                    .cache(CacheParam::new("key", "v", |s| Ok(s.arg(0).clone())))
                    .guard(
                        Guard::new("v == key", |s| s.arg(0) == s.cached(0))
                            .reads(Reads::ARGS | Reads::CACHED),
                    )
                    .limit(2),
            )
            .specialization(
                Specialization::new("generic", |c| Ok(c.arg(0).clone()))
                    .typed([ValueType::Int])
                    .replaces("keyed")
                    .megamorphic(),
            )
            .report_polymorphism(move |r| {
                sink.lock()
                    .push((r.kind, r.specialization.to_string(), r.instances));
            })
            .build(DispatchConfig::default())
            .unwrap()
    }

    #[test]
    fn test_each_report_fires_once() {
        let reports: Reports = Arc::default();
        let node = DispatchNode::new(table(&reports), &NodeArena::shared());

        node.execute(&[Value::Int(1)]).unwrap();
        assert!(reports.lock().is_empty());

        node.execute(&[Value::Int(2)]).unwrap();
        node.execute(&[Value::Int(1)]).unwrap();
        assert_eq!(
            *reports.lock(),
            vec![(PolymorphismKind::Polymorphic, "keyed".to_string(), 2)]
        );

        // Third key overflows the limit and activates the megamorphic generic.
        node.execute(&[Value::Int(3)]).unwrap();
        node.execute(&[Value::Int(4)]).unwrap();
        assert_eq!(
            *reports.lock(),
            vec![
                (PolymorphismKind::Polymorphic, "keyed".to_string(), 2),
                (PolymorphismKind::Megamorphic, "generic".to_string(), 1),
            ]
        );
        let stats = node.stats().snapshot();
        assert_eq!(stats.polymorphic_transitions, 1);
        assert_eq!(stats.megamorphic_activations, 1);
    }

    #[test]
    fn test_reporting_enablement() {
        let reports: Reports = Arc::default();
        assert!(table(&reports).reports_polymorphism());

        let single = SpecializationTable::builder("Single", 0)
            .specialization(Specialization::new("only", |_| Ok(Value::Null)))
            .report_polymorphism(|_| {})
            .build(DispatchConfig::default())
            .unwrap();
        assert!(!single.reports_polymorphism());

        let silent = SpecializationTable::builder("Silent", 0)
            .specialization(Specialization::new("a", |_| Ok(Value::Null)))
            .specialization(Specialization::new("b", |_| Ok(Value::Null)))
            .build(DispatchConfig::default())
            .unwrap();
        assert!(!silent.reports_polymorphism());
    }
}
