//! Property-based tests for rule graph compilation.
//!
//! Rules are generated over a fixed universe of marker types so that products,
//! dependencies and params can be picked by index.

use cairn_rule_graph::{Error, GetDeclaration, Query, Resolution, RuleGraph, RuleNodeData, TypeKey};
use proptest::prelude::*;
use std::collections::BTreeSet;

struct T0;
struct T1;
struct T2;
struct T3;
struct T4;
struct T5;

fn universe() -> [TypeKey; 6] {
    [
        TypeKey::of::<T0>(),
        TypeKey::of::<T1>(),
        TypeKey::of::<T2>(),
        TypeKey::of::<T3>(),
        TypeKey::of::<T4>(),
        TypeKey::of::<T5>(),
    ]
}

#[derive(Debug, Clone)]
struct PropRule {
    name: String,
    product: TypeKey,
    deps: Vec<TypeKey>,
}

impl RuleNodeData for PropRule {
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
        &[]
    }
}

/// Rules as (product index, dependency indices).
fn rules_strategy() -> impl Strategy<Value = Vec<(usize, Vec<usize>)>> {
    proptest::collection::vec(
        (0..6usize, proptest::collection::vec(0..6usize, 0..3)),
        0..8,
    )
}

fn build_rules(layout: &[(usize, Vec<usize>)]) -> Vec<PropRule> {
    let types = universe();
    layout.iter()
        .enumerate()
        .map(|(i, (product, deps))| PropRule {
            name: format!("rule_{i}"),
            product: types[*product],
            deps: deps.iter().map(|d| types[*d]).collect(),
        })
        .collect()
}

proptest! {
    /// A successful compilation resolves the query with a rule whose inputs are all resolved.
    #[test]
    fn resolved_entries_are_closed(
        layout in rules_strategy(),
        product in 0..6usize,
        params in proptest::collection::btree_set(0..6usize, 0..3),
    ) {
        let types = universe();
        let query = Query::new(types[product], params.iter().map(|p| types[*p]));
        if let Ok(graph) = RuleGraph::build(build_rules(&layout), vec![query.clone()]) {
            prop_assert!(graph.entry(&query.entry_key()).is_some());
            for (_, entry) in graph.entries() {
                if let Resolution::Rule(rule) = &entry.resolution {
                    for dep in &rule.dependencies {
                        prop_assert!(graph.entry(dep).is_some());
                    }
                }
            }
        }
    }

    /// Used params are always a subset of the params in scope.
    #[test]
    fn used_params_within_scope(
        layout in rules_strategy(),
        product in 0..6usize,
        params in proptest::collection::btree_set(0..6usize, 0..4),
    ) {
        let types = universe();
        let query = Query::new(types[product], params.iter().map(|p| types[*p]));
        if let Ok(graph) = RuleGraph::build(build_rules(&layout), vec![query]) {
            for (key, entry) in graph.entries() {
                prop_assert!(entry.used_params.is_subset(&key.params));
            }
        }
    }

    /// Compilation errors only ever name products, never succeed partially.
    #[test]
    fn errors_are_reported_for_the_query(
        layout in rules_strategy(),
        product in 0..6usize,
    ) {
        let types = universe();
        let query = Query::new(types[product], []);
        match RuleGraph::build(build_rules(&layout), vec![query]) {
            Ok(graph) => prop_assert!(!graph.is_empty()),
            Err(err) => {
                for error in err.flatten() {
                    let expected = matches!(error, Error::NoRule { .. } | Error::Ambiguous { .. });
                    prop_assert!(expected, "unexpected error: {}", error);
                }
            }
        }
    }

    /// Two rules with identical signatures for a queried product are always ambiguous.
    #[test]
    fn duplicate_rules_are_ambiguous(product in 1..6usize) {
        let types = universe();
        let layout = vec![(product, vec![0]), (product, vec![0])];
        let err = RuleGraph::build(
            build_rules(&layout),
            vec![Query::new(types[product], [types[0]])],
        )
        .unwrap_err();
        let names: BTreeSet<_> = match err {
            Error::Ambiguous { candidates, .. } => candidates.into_iter().collect(),
            other => return Err(TestCaseError::fail(format!("unexpected error: {other}"))),
        };
        prop_assert_eq!(names.len(), 2);
    }
}
