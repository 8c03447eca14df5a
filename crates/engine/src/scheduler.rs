//! The long-lived engine instance.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fs::{self, Workspace};
use crate::intrinsics;
use crate::nodes::NodeKey;
use crate::process::CommandRunner;
use crate::rule::{Rule, RuleSet};
use crate::session::Session;
use cairn_graph::{Graph, GraphStats, InvalidationResult};
use cairn_rule_graph::{GraphSummary, RuleGraph};
use cairn_store::{ActionCache, Store};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// State shared by every session and every running node.
pub struct Core {
    pub(crate) rule_graph: RuleGraph<Rule>,
    pub(crate) graph: Graph<NodeKey>,
    pub(crate) store: Store,
    pub(crate) runner: CommandRunner,
    pub(crate) workspace: Workspace,
    pub(crate) config: EngineConfig,
}

/// Compiled rules plus the memo graph, store and process runner.
///
/// Built once per program and shared by reference; sessions created from
/// it share memoized results.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<Core>,
}

impl Scheduler {
    /// Compile `rules` and open the configured store
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compilation`] if the rule graph has missing or
    /// ambiguous rules, or [`Error::Configuration`] for invalid config
    pub fn new(rules: RuleSet, config: EngineConfig) -> Result<Self> {
        let (store, action_cache) = config.open_store()?;
        Self::with_store(rules, config, store, action_cache)
    }

    /// Compile `rules` against an existing store and action cache
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compilation`] if the rule graph has missing or
    /// ambiguous rules, or [`Error::Configuration`] if two rules share a name
    pub fn with_store(
        rules: RuleSet,
        config: EngineConfig,
        store: Store,
        action_cache: ActionCache,
    ) -> Result<Self> {
        let RuleSet { mut rules, queries } = rules;
        rules.extend(intrinsics::rules());

        let mut names = HashSet::new();
        for rule in &rules {
            if !names.insert(rule.name()) {
                return Err(Error::configuration(format!(
                    "rule name '{}' is registered more than once",
                    rule.name()
                )));
            }
        }

        let rule_graph = RuleGraph::build(rules, queries)?;
        let summary = rule_graph.summary();
        info!(
            rules = summary.rules,
            queries = summary.queries,
            entries = summary.entries,
            "Scheduler ready"
        );

        let workspace = Workspace::new(
            config.workspace.resolve_root()?,
            &config.workspace.ignore,
            config.workspace.respect_gitignore,
        )
        .map_err(|failure| Error::configuration(failure.to_string()))?;

        let runner = CommandRunner::new(
            store.clone(),
            action_cache,
            config.process.max_parallel,
            config.process.cache,
            config.process.keep_sandboxes,
            config.default_timeout(),
        );

        Ok(Self {
            core: Arc::new(Core {
                rule_graph,
                graph: Graph::new(),
                store,
                runner,
                workspace,
                config,
            }),
        })
    }

    /// Start a session
    #[must_use]
    pub fn new_session(&self) -> Session {
        Session::new(Arc::clone(&self.core))
    }

    /// The content-addressed store
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.core.store
    }

    /// The process action cache
    #[must_use]
    pub fn action_cache(&self) -> &ActionCache {
        self.core.runner.action_cache()
    }

    /// The active configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// The compiled rule graph
    #[must_use]
    pub fn rule_graph(&self) -> &RuleGraph<Rule> {
        &self.core.rule_graph
    }

    /// Counts of rules, queries, entries and unreachable rules
    #[must_use]
    pub fn summary(&self) -> GraphSummary {
        self.core.rule_graph.summary()
    }

    /// Graphviz rendering of the compiled rule graph
    #[must_use]
    pub fn visualize(&self) -> String {
        self.core.rule_graph.to_dot()
    }

    /// Memo graph counters
    #[must_use]
    pub fn graph_stats(&self) -> GraphStats {
        self.core.graph.stats()
    }

    /// Number of memoized entries
    #[must_use]
    pub fn graph_len(&self) -> usize {
        self.core.graph.len()
    }

    /// Clear memoized nodes matching `predicate` and dirty their dependents
    pub fn invalidate(&self, predicate: impl Fn(&NodeKey) -> bool) -> InvalidationResult {
        self.core.graph.invalidate_from_roots(predicate)
    }

    /// Clear every memoized application of the named rule
    pub fn invalidate_rule(&self, name: &str) -> InvalidationResult {
        self.invalidate(|node| node.rule_name() == Some(name))
    }

    /// Clear the workspace snapshots that `changed` paths may affect
    ///
    /// Paths are relative to the workspace root. Rules that read those
    /// snapshots rerun on next request, and stop propagating once their
    /// output is unchanged.
    pub fn invalidate_paths<S: AsRef<str>>(&self, changed: &[S]) -> InvalidationResult {
        let result = self.invalidate(|node| {
            node.path_globs().is_some_and(|globs| {
                changed
                    .iter()
                    .any(|path| fs::affected_by(globs, path.as_ref()))
            })
        });
        debug!(
            changed = changed.len(),
            cleared = result.cleared,
            dirtied = result.dirtied,
            "Invalidated workspace paths"
        );
        result
    }

    /// The workspace root globs are expanded against
    #[must_use]
    pub fn workspace_root(&self) -> &std::path::Path {
        self.core.workspace.root()
    }

    /// Drop every memoized entry
    pub fn invalidate_all(&self) {
        self.core.graph.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Failure;
    use crate::context::RuleContext;
    use cairn_rule_graph::TypeKey;
    use serde::Serialize;

    #[derive(Debug, Clone, Serialize)]
    struct Input(u32);

    #[derive(Debug, Clone, Serialize)]
    struct Output(u32);

    async fn double(_ctx: RuleContext, input: Input) -> std::result::Result<Output, Failure> {
        Ok(Output(input.0 * 2))
    }

    fn memory_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.store.memory_only = true;
        config
    }

    #[test]
    fn test_duplicate_rule_names_are_rejected() {
        let rules = RuleSet::builder()
            .rule(Rule::new("double", double))
            .rule(Rule::new("double", double))
            .query::<Output>([TypeKey::of::<Input>()])
            .build();
        let err = Scheduler::new(rules, memory_config()).err().unwrap();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_intrinsics_are_registered_but_not_unreachable() {
        let rules = RuleSet::builder()
            .rule(Rule::new("double", double))
            .query::<Output>([TypeKey::of::<Input>()])
            .build();
        let scheduler = Scheduler::new(rules, memory_config()).unwrap();
        let summary = scheduler.summary();
        assert!(summary.rules > 1);
        assert!(summary.unreachable.is_empty());
        assert!(scheduler.visualize().contains("double"));
    }
}
