//! Resolution of queries into rule graph entries.
//!
//! Resolution is a memoized depth-first search over `(product, params)`
//! entries. An entry is satisfied by a param of the same type when one is in
//! scope, otherwise by the unique rule whose positional dependencies and Gets
//! are all satisfiable. Entries reached again while still being resolved are
//! assumed satisfiable; a pruning pass afterwards removes entries whose
//! assumption turned out to be wrong.

use crate::types::{EntryKey, ParamTypes, Query, TypeKey, display_params};
use crate::{Error, RuleId, RuleNodeData};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

/// How an entry is computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The entry's product is a param in scope.
    Param(TypeKey),
    /// The entry is computed by a rule.
    Rule(RuleResolution),
}

/// A rule selected for an entry, with the entries for its inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleResolution {
    /// The selected rule
    pub rule: RuleId,
    /// Entries for the rule's positional dependencies, in order
    pub dependencies: Vec<EntryKey>,
    /// Entries for each declared Get, in declaration order
    pub gets: Vec<(crate::GetDeclaration, EntryKey)>,
}

impl Resolution {
    /// Entries this resolution refers to
    pub fn references(&self) -> impl Iterator<Item = &EntryKey> {
        let (deps, gets): (&[EntryKey], &[(crate::GetDeclaration, EntryKey)]) = match self {
            Self::Param(_) => (&[], &[]),
            Self::Rule(rule) => (&rule.dependencies, &rule.gets),
        };
        deps.iter().chain(gets.iter().map(|(_, key)| key))
    }
}

enum Unsatisfied {
    /// Nothing can produce the entry; each string explains one dead end.
    Missing(Vec<String>),
    /// An ambiguity (already recorded) blocks the entry.
    Ambiguous,
}

pub(crate) struct Builder<'a, R> {
    rules: &'a [R],
    by_product: HashMap<TypeKey, Vec<RuleId>>,
    resolved: HashMap<EntryKey, Resolution>,
    failed: HashMap<EntryKey, Vec<String>>,
    blocked: HashSet<EntryKey>,
    in_progress: HashSet<EntryKey>,
    ambiguities: BTreeMap<EntryKey, Error>,
}

/// The outcome of a successful build.
pub(crate) struct Resolved {
    pub entries: HashMap<EntryKey, (Resolution, ParamTypes)>,
    pub used_rules: BTreeSet<RuleId>,
}

impl<'a, R: RuleNodeData> Builder<'a, R> {
    pub fn new(rules: &'a [R]) -> Self {
        let mut by_product: HashMap<TypeKey, Vec<RuleId>> = HashMap::new();
        for (index, rule) in rules.iter().enumerate() {
            by_product
                .entry(rule.product())
                .or_default()
                .push(RuleId(index));
        }
        Self {
            rules,
            by_product,
            resolved: HashMap::new(),
            failed: HashMap::new(),
            blocked: HashSet::new(),
            in_progress: HashSet::new(),
            ambiguities: BTreeMap::new(),
        }
    }

    pub fn build(mut self, queries: &[Query]) -> Result<Resolved, Error> {
        let mut errors = Vec::new();

        for query in queries {
            let key = query.entry_key();
            debug!(%query, "Resolving query");
            if let Err(Unsatisfied::Missing(reasons)) = self.resolve(&key) {
                errors.push(no_rule(&key, reasons));
            }
        }

        self.prune();

        for query in queries {
            let key = query.entry_key();
            if !self.resolved.contains_key(&key)
                && !self.failed.contains_key(&key)
                && !self.blocked.contains(&key)
            {
                errors.push(no_rule(
                    &key,
                    vec!["every candidate depends on itself without a base case".to_string()],
                ));
            }
        }

        errors.extend(std::mem::take(&mut self.ambiguities).into_values());
        if let Some(error) = Error::from_many(errors) {
            return Err(error);
        }

        let reachable = self.reachable(queries);
        self.resolved.retain(|key, _| reachable.contains(key));

        let used_rules = self
            .resolved
            .values()
            .filter_map(|resolution| match resolution {
                Resolution::Rule(rule) => Some(rule.rule),
                Resolution::Param(_) => None,
            })
            .collect();

        let used_params = self.used_params();
        let entries = self
            .resolved
            .into_iter()
            .map(|(key, resolution)| {
                let used = used_params.get(&key).cloned().unwrap_or_default();
                (key, (resolution, used))
            })
            .collect();

        Ok(Resolved {
            entries,
            used_rules,
        })
    }

    fn resolve(&mut self, key: &EntryKey) -> Result<(), Unsatisfied> {
        if self.resolved.contains_key(key) || self.in_progress.contains(key) {
            return Ok(());
        }
        if let Some(reasons) = self.failed.get(key) {
            return Err(Unsatisfied::Missing(reasons.clone()));
        }
        if self.blocked.contains(key) {
            return Err(Unsatisfied::Ambiguous);
        }

        if key.params.contains(&key.product) {
            trace!(entry = %key, "Satisfied by param");
            self.resolved
                .insert(key.clone(), Resolution::Param(key.product));
            return Ok(());
        }

        let candidates = self
            .by_product
            .get(&key.product)
            .cloned()
            .unwrap_or_default();
        if candidates.is_empty() {
            let reasons = vec![format!("no rule produces {}", key.product)];
            self.failed.insert(key.clone(), reasons.clone());
            return Err(Unsatisfied::Missing(reasons));
        }

        self.in_progress.insert(key.clone());
        let mut viable = Vec::new();
        let mut reasons = Vec::new();
        let mut blocked = false;
        for id in candidates {
            match self.try_rule(key, id) {
                Ok(resolution) => viable.push(resolution),
                Err(Unsatisfied::Missing(why)) => reasons.extend(why),
                Err(Unsatisfied::Ambiguous) => blocked = true,
            }
        }
        self.in_progress.remove(key);

        match viable.len() {
            1 => {
                let resolution = viable.remove(0);
                trace!(entry = %key, rule = self.rules[resolution.rule.0].name(), "Resolved");
                self.resolved.insert(key.clone(), Resolution::Rule(resolution));
                Ok(())
            }
            0 if blocked => {
                self.blocked.insert(key.clone());
                Err(Unsatisfied::Ambiguous)
            }
            0 => {
                self.failed.insert(key.clone(), reasons.clone());
                Err(Unsatisfied::Missing(reasons))
            }
            _ => {
                let mut names: Vec<String> = viable
                    .iter()
                    .map(|r| self.rules[r.rule.0].name().to_string())
                    .collect();
                names.sort();
                self.ambiguities.insert(
                    key.clone(),
                    Error::Ambiguous {
                        product: key.product.name(),
                        params: display_params(&key.params),
                        candidates: names,
                    },
                );
                self.blocked.insert(key.clone());
                Err(Unsatisfied::Ambiguous)
            }
        }
    }

    fn try_rule(&mut self, key: &EntryKey, id: RuleId) -> Result<RuleResolution, Unsatisfied> {
        let rule = &self.rules[id.0];
        let name = rule.name().to_string();
        let dependency_types = rule.dependencies().to_vec();
        let gets = rule.gets().to_vec();

        let mut dependencies = Vec::with_capacity(dependency_types.len());
        for product in dependency_types {
            let dep = key.for_dependency(product);
            match self.resolve(&dep) {
                Ok(()) => dependencies.push(dep),
                Err(Unsatisfied::Missing(why)) => {
                    return Err(Unsatisfied::Missing(
                        why.into_iter()
                            .map(|w| format!("rule `{name}` needs {product}, but {w}"))
                            .collect(),
                    ));
                }
                Err(Unsatisfied::Ambiguous) => return Err(Unsatisfied::Ambiguous),
            }
        }

        let mut resolved_gets = Vec::with_capacity(gets.len());
        for get in gets {
            let target = key.for_get(&get);
            match self.resolve(&target) {
                Ok(()) => resolved_gets.push((get, target)),
                Err(Unsatisfied::Missing(why)) => {
                    return Err(Unsatisfied::Missing(
                        why.into_iter()
                            .map(|w| format!("rule `{name}` requests {get}, but {w}"))
                            .collect(),
                    ));
                }
                Err(Unsatisfied::Ambiguous) => return Err(Unsatisfied::Ambiguous),
            }
        }

        Ok(RuleResolution {
            rule: id,
            dependencies,
            gets: resolved_gets,
        })
    }

    /// Drop entries that refer to entries which never resolved.
    fn prune(&mut self) {
        loop {
            let broken: Vec<EntryKey> = self
                .resolved
                .iter()
                .filter(|(_, resolution)| {
                    resolution
                        .references()
                        .any(|key| !self.resolved.contains_key(key))
                })
                .map(|(key, _)| key.clone())
                .collect();
            if broken.is_empty() {
                break;
            }
            for key in broken {
                debug!(entry = %key, "Pruning entry with an unsatisfiable input");
                self.resolved.remove(&key);
            }
        }
    }

    fn reachable(&self, queries: &[Query]) -> HashSet<EntryKey> {
        let mut seen = HashSet::new();
        let mut pending: Vec<EntryKey> = queries.iter().map(Query::entry_key).collect();
        while let Some(key) = pending.pop() {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(resolution) = self.resolved.get(&key) {
                pending.extend(resolution.references().cloned());
            }
        }
        seen
    }

    /// Params each entry transitively consumes, computed to a fixpoint.
    fn used_params(&self) -> HashMap<EntryKey, ParamTypes> {
        let mut used: HashMap<EntryKey, ParamTypes> = self
            .resolved
            .keys()
            .map(|key| (key.clone(), ParamTypes::new()))
            .collect();

        loop {
            let mut changed = false;
            for (key, resolution) in &self.resolved {
                let next = match resolution {
                    Resolution::Param(product) => std::iter::once(*product).collect(),
                    Resolution::Rule(rule) => {
                        let mut set = ParamTypes::new();
                        for dep in &rule.dependencies {
                            set.extend(used.get(dep).into_iter().flatten().copied());
                        }
                        for (get, target) in &rule.gets {
                            set.extend(
                                used.get(target)
                                    .into_iter()
                                    .flatten()
                                    .copied()
                                    .filter(|param| *param != get.input),
                            );
                        }
                        set
                    }
                };
                if used.get(key) != Some(&next) {
                    used.insert(key.clone(), next);
                    changed = true;
                }
            }
            if !changed {
                return used;
            }
        }
    }
}

fn no_rule(key: &EntryKey, reasons: Vec<String>) -> Error {
    Error::NoRule {
        product: key.product.name(),
        params: display_params(&key.params),
        reasons,
    }
}
