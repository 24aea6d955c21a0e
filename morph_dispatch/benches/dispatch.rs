//! Dispatch Performance Benchmarks
//!
//! Measures the cost of reaching a specialization body through a dispatch
//! node once its instances are warm, and the cost of getting there.
//!
//! # Benchmark Categories
//!
//! 1. **Monomorphic Hit**: Single cached instance, guard-free fast path
//! 2. **Polymorphic Hit**: Keyed instances walked in insertion order
//! 3. **Uncached**: Full guard evaluation on every call, no node state
//! 4. **Slow Path**: Reset followed by re-specialization under the node lock
//! 5. **Assumptions**: Fast path with valid assumption checks
//!
//! # Performance Targets
//!
//! - Monomorphic hit: < 50ns
//! - Polymorphic hit (4 instances): < 150ns
//! - Slow path: < 2µs including instance publication

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use morph_dispatch::{
    Assumption, AssumptionExpr, CacheParam, DispatchConfig, DispatchNode, Guard, NodeArena,
    Reads, Specialization, SpecializationTable, UncachedNode, Value, ValueType,
};
use std::sync::Arc;

// =============================================================================
// Benchmark Helpers
// =============================================================================

fn add_table() -> Arc<SpecializationTable> {
    SpecializationTable::builder("Add", 2)
        .specialization(
            Specialization::new("ints", |c| {
                let a = c.arg(0).as_int().unwrap_or(0);
                let b = c.arg(1).as_int().unwrap_or(0);
                Ok(Value::Int(a.wrapping_add(b)))
            })
            .typed([ValueType::Int, ValueType::Int]),
        )
        .specialization(
            Specialization::new("doubles", |c| {
                let a = c.arg(0).as_double().unwrap_or(0.0);
                let b = c.arg(1).as_double().unwrap_or(0.0);
                Ok(Value::Double(a + b))
            })
            .typed([ValueType::Double, ValueType::Double]),
        )
        .build(DispatchConfig::default())
        .unwrap()
}

/// Keyed table holding up to `limit` instances.
fn keyed_table(limit: usize) -> Arc<SpecializationTable> {
    SpecializationTable::builder("Keyed", 1)
        .specialization(
            Specialization::new("keyed", |c| Ok(c.cached(0).clone()))
                .typed([ValueType::Int])
                .cache(CacheParam::new("key", "v", |s| Ok(s.arg(0).clone())))
                .guard(
                    Guard::new("v == key", |s| s.arg(0) == s.cached(0))
                        .reads(Reads::ARGS | Reads::CACHED),
                )
                .limit(limit),
        )
        .build(DispatchConfig::default())
        .unwrap()
}

// =============================================================================
// Fast Path Benchmarks
// =============================================================================

fn bench_monomorphic(c: &mut Criterion) {
    let mut group = c.benchmark_group("monomorphic");

    group.bench_function("int_add", |b| {
        let node = DispatchNode::new(add_table(), &NodeArena::shared());
        let args = [Value::Int(1), Value::Int(2)];
        node.execute(&args).unwrap();
        b.iter(|| black_box(node.execute(black_box(&args))))
    });

    // Direct call for comparison
    group.bench_function("direct_baseline", |b| {
        let args = [Value::Int(1), Value::Int(2)];
        b.iter(|| {
            let a = black_box(&args)[0].as_int().unwrap_or(0);
            let c = black_box(&args)[1].as_int().unwrap_or(0);
            black_box(Value::Int(a.wrapping_add(c)))
        })
    });

    group.finish();
}

fn bench_polymorphic(c: &mut Criterion) {
    let mut group = c.benchmark_group("polymorphic");

    for count in [1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("keyed", count), &count, |b, &count| {
            let node = DispatchNode::new(keyed_table(count), &NodeArena::shared());
            let keys: Vec<Value> = (0..count as i32).map(Value::Int).collect();
            for key in &keys {
                node.execute(std::slice::from_ref(key)).unwrap();
            }
            // Last inserted key walks the whole snapshot.
            let last = [keys[count - 1].clone()];
            b.iter(|| black_box(node.execute(black_box(&last))))
        });
    }

    group.bench_function("mixed_types", |b| {
        let node = DispatchNode::new(add_table(), &NodeArena::shared());
        let ints = [Value::Int(1), Value::Int(2)];
        let doubles = [Value::Double(1.0), Value::Double(2.0)];
        b.iter(|| {
            black_box(node.execute(black_box(&ints)).ok());
            black_box(node.execute(black_box(&doubles)).ok())
        })
    });

    group.finish();
}

// =============================================================================
// Uncached Benchmarks
// =============================================================================

fn bench_uncached(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncached");

    group.bench_function("int_add", |b| {
        let node = UncachedNode::new(add_table());
        let args = [Value::Int(1), Value::Int(2)];
        b.iter(|| black_box(node.execute(black_box(&args))))
    });

    group.bench_function("keyed", |b| {
        let node = UncachedNode::new(keyed_table(4));
        let args = [Value::Int(3)];
        b.iter(|| black_box(node.execute(black_box(&args))))
    });

    group.finish();
}

// =============================================================================
// Slow Path Benchmarks
// =============================================================================

fn bench_slow_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("slow_path");

    group.bench_function("reset_and_specialize", |b| {
        let node = DispatchNode::new(add_table(), &NodeArena::shared());
        let args = [Value::Int(1), Value::Int(2)];
        b.iter(|| {
            node.reset().unwrap();
            black_box(node.execute(black_box(&args)))
        })
    });

    group.bench_function("node_creation", |b| {
        let table = add_table();
        let arena = NodeArena::shared();
        b.iter(|| black_box(DispatchNode::new(table.clone(), &arena)))
    });

    group.finish();
}

// =============================================================================
// Assumption Benchmarks
// =============================================================================

fn bench_assumptions(c: &mut Criterion) {
    let mut group = c.benchmark_group("assumptions");

    group.bench_function("valid_assumption_hit", |b| {
        let assumption = Assumption::new("bench");
        let table = SpecializationTable::builder("Assumed", 0)
            .specialization(
                Specialization::new("fast", |_| Ok(Value::Int(1)))
                    .assumption(AssumptionExpr::fixed(assumption.clone())),
            )
            .specialization(Specialization::new("slow", |_| Ok(Value::Int(0))).fallback())
            .build(DispatchConfig::default())
            .unwrap();
        let node = DispatchNode::new(table, &NodeArena::shared());
        node.execute(&[]).unwrap();
        b.iter(|| black_box(node.execute(&[])))
    });

    group.finish();
}

// =============================================================================
// Criterion Groups
// =============================================================================

criterion_group!(
    dispatch_benches,
    bench_monomorphic,
    bench_polymorphic,
    bench_uncached,
    bench_slow_path,
    bench_assumptions,
);

criterion_main!(dispatch_benches);
