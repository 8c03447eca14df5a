//! Diagnostics for compiled rule graphs.

use crate::builder::Resolution;
use crate::types::display_params;
use crate::{RuleGraph, RuleNodeData};
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Summary of a compiled graph, for logging or display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSummary {
    /// Number of registered rules
    pub rules: usize,
    /// Number of declared queries
    pub queries: usize,
    /// Number of resolved entries
    pub entries: usize,
    /// Names of rules no query reaches
    pub unreachable: Vec<String>,
}

impl<R: RuleNodeData> RuleGraph<R> {
    /// Summarize the graph
    #[must_use]
    pub fn summary(&self) -> GraphSummary {
        let mut unreachable: Vec<String> = self
            .unreachable_rules()
            .map(|r| r.name().to_string())
            .collect();
        unreachable.sort();
        GraphSummary {
            rules: self.rules.len(),
            queries: self.queries.len(),
            entries: self.entries.len(),
            unreachable,
        }
    }

    /// Render the graph in Graphviz DOT format
    ///
    /// Queries and entries are nodes; edges point from a consumer to the
    /// entries it needs, labelled with the positional index or the Get.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut graph: DiGraph<String, String> = DiGraph::new();
        let mut nodes: HashMap<&crate::EntryKey, NodeIndex> = HashMap::new();

        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        for key in keys {
            let Some(entry) = self.entries.get(key) else {
                continue;
            };
            let label = match &entry.resolution {
                Resolution::Param(product) => format!("Param({product})"),
                Resolution::Rule(rule) => format!(
                    "{} <- {} for {}",
                    key.product,
                    self.rules
                        .get(rule.rule.0)
                        .map_or("<unknown>", RuleNodeData::name),
                    display_params(&entry.used_params)
                ),
            };
            nodes.insert(key, graph.add_node(label));
        }

        for (key, entry) in &self.entries {
            let (Resolution::Rule(rule), Some(&from)) = (&entry.resolution, nodes.get(key)) else {
                continue;
            };
            for (index, dep) in rule.dependencies.iter().enumerate() {
                if let Some(&to) = nodes.get(dep) {
                    graph.add_edge(from, to, format!("#{index}"));
                }
            }
            for (get, target) in &rule.gets {
                if let Some(&to) = nodes.get(target) {
                    graph.add_edge(from, to, get.to_string());
                }
            }
        }

        for query in &self.queries {
            let node = graph.add_node(query.to_string());
            if let Some(&to) = nodes.get(&query.entry_key()) {
                graph.add_edge(node, to, String::new());
            }
        }

        format!(
            "digraph rules {{\n{}}}\n",
            Dot::with_config(&graph, &[Config::GraphContentOnly])
        )
    }
}
