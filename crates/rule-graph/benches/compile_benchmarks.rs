//! Benchmarks for rule graph compilation
//!
//! Run with: cargo bench -p cairn-rule-graph

#![allow(clippy::unwrap_used)]

use cairn_rule_graph::{GetDeclaration, Query, RuleGraph, RuleNodeData, TypeKey};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

struct Level<const N: usize>;

#[derive(Debug, Clone)]
struct BenchRule {
    name: String,
    product: TypeKey,
    deps: Vec<TypeKey>,
    gets: Vec<GetDeclaration>,
}

impl RuleNodeData for BenchRule {
    fn name(&self) -> &str {
        &self.name
    }
    fn product(&self) -> TypeKey {
        self.product
    }
    fn dependencies(&self) -> &[TypeKey] {
        &self.deps
    }
    fn gets(&self) -> &[GetDeclaration] {
        &self.gets
    }
}

macro_rules! levels {
    ($($n:literal),*) => {
        vec![$(TypeKey::of::<Level<$n>>()),*]
    };
}

fn all_levels() -> Vec<TypeKey> {
    levels!(
        0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31
    )
}

/// A chain where each level depends on the previous one.
fn chain(depth: usize) -> (Vec<BenchRule>, Query) {
    let types = all_levels();
    let rules = (1..depth)
        .map(|i| BenchRule {
            name: format!("level_{i}"),
            product: types[i],
            deps: vec![types[i - 1]],
            gets: Vec::new(),
        })
        .collect();
    (rules, Query::new(types[depth - 1], [types[0]]))
}

/// Every level depends on all previous levels and also Gets the previous one.
fn dense(depth: usize) -> (Vec<BenchRule>, Query) {
    let types = all_levels();
    let rules = (1..depth)
        .map(|i| BenchRule {
            name: format!("level_{i}"),
            product: types[i],
            deps: types[..i].to_vec(),
            gets: vec![GetDeclaration {
                product: types[i - 1],
                input: types[0],
            }],
        })
        .collect();
    (rules, Query::new(types[depth - 1], [types[0]]))
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    for depth in [8, 16, 32] {
        group.bench_with_input(BenchmarkId::new("chain", depth), &depth, |b, &depth| {
            b.iter(|| {
                let (rules, query) = chain(depth);
                black_box(RuleGraph::build(rules, vec![query]).unwrap())
            });
        });
        group.bench_with_input(BenchmarkId::new("dense", depth), &depth, |b, &depth| {
            b.iter(|| {
                let (rules, query) = dense(depth);
                black_box(RuleGraph::build(rules, vec![query]).unwrap())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);
