//! The compiled rule graph.

use crate::builder::{Builder, Resolution};
use crate::types::{EntryKey, GetDeclaration, ParamTypes, Query, TypeKey, display_params};
use crate::{Error, Result, RuleId, RuleNodeData};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// A resolved entry: how it is computed and which params it consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// How the entry's product is obtained
    pub resolution: Resolution,
    /// Params the entry transitively consumes; the runtime memo key
    pub used_params: ParamTypes,
}

/// Rules plus the static plan for every reachable entry.
#[derive(Debug)]
pub struct RuleGraph<R> {
    pub(crate) rules: Vec<R>,
    pub(crate) entries: HashMap<EntryKey, Entry>,
    pub(crate) queries: Vec<Query>,
    pub(crate) used_rules: BTreeSet<RuleId>,
}

impl<R: RuleNodeData> RuleGraph<R> {
    /// Compile `rules` for the given root `queries`.
    ///
    /// # Errors
    ///
    /// Returns every `NoRule` and `Ambiguous` error found, aggregated into
    /// [`Error::Multiple`] when there is more than one
    pub fn build(rules: Vec<R>, queries: Vec<Query>) -> Result<Self> {
        let resolved = Builder::new(&rules).build(&queries)?;
        let entries = resolved
            .entries
            .into_iter()
            .map(|(key, (resolution, used_params))| {
                (
                    key,
                    Entry {
                        resolution,
                        used_params,
                    },
                )
            })
            .collect::<HashMap<_, _>>();

        let graph = Self {
            rules,
            entries,
            queries,
            used_rules: resolved.used_rules,
        };

        for rule in graph.unreachable_rules() {
            warn!(
                rule = rule.name(),
                product = %rule.product(),
                "Rule is not reachable from any query"
            );
        }
        debug!(
            rules = graph.rules.len(),
            entries = graph.entries.len(),
            queries = graph.queries.len(),
            "Compiled rule graph"
        );

        Ok(graph)
    }

    /// All registered rules
    #[must_use]
    pub fn rules(&self) -> &[R] {
        &self.rules
    }

    /// The rule with the given id
    #[must_use]
    pub fn rule(&self, id: RuleId) -> Option<&R> {
        self.rules.get(id.0)
    }

    /// Declared root queries
    #[must_use]
    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    /// Number of resolved entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the graph has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a resolved entry
    #[must_use]
    pub fn entry(&self, key: &EntryKey) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// The entry for a root request
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoQuery`] if no query with exactly these params was declared
    pub fn find_root(&self, product: TypeKey, params: &ParamTypes) -> Result<(&EntryKey, &Entry)> {
        let key = EntryKey {
            product,
            params: params.clone(),
        };
        let declared = self.queries.iter().any(|q| q.product == product && &q.params == params);
        match self.entries.get_key_value(&key) {
            Some(found) if declared => Ok(found),
            _ => Err(Error::NoQuery {
                product: product.name(),
                params: display_params(params),
            }),
        }
    }

    /// The entry a `Get` issued from `caller` resolves to
    #[must_use]
    pub fn get_target(&self, caller: &EntryKey, get: &GetDeclaration) -> Option<(&EntryKey, &Entry)> {
        let Resolution::Rule(rule) = &self.entries.get(caller)?.resolution else {
            return None;
        };
        let (_, target) = rule.gets.iter().find(|(declared, _)| declared == get)?;
        self.entries.get_key_value(target)
    }

    /// Non-intrinsic rules not used by any query
    pub fn unreachable_rules(&self) -> impl Iterator<Item = &R> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| !rule.is_intrinsic())
            .filter(|(index, _)| !self.used_rules.contains(&RuleId(*index)))
            .map(|(_, rule)| rule)
    }

    /// Iterate over every resolved entry
    pub fn entries(&self) -> impl Iterator<Item = (&EntryKey, &Entry)> {
        self.entries.iter()
    }
}
