//! Memo graph nodes.
//!
//! A [`NodeKey`] is a rule entry of the compiled rule graph together with the
//! values of the params it uses, a process request, or a workspace glob
//! expansion. Entries resolved to a param never become nodes; their value is
//! taken from scope.

use crate::context::{RuleContext, collect_all};
use crate::error::Failure;
use crate::fs::PathGlobs;
use crate::intrinsics::blocking;
use crate::process::Process;
use crate::scheduler::Core;
use crate::value::{Params, Value};
use async_trait::async_trait;
use cairn_events::{emit_rule_completed, emit_rule_started};
use cairn_graph::{Context, Node};
use cairn_rule_graph::{EntryKey, Resolution};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// A unit of memoized work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
    /// A rule applied to the values of its used params
    Rule(RuleNode),
    /// A subprocess
    Process(ProcessNode),
    /// A snapshot of the workspace paths matching some globs
    Glob(GlobNode),
}

/// A rule entry and the param values it consumes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleNode {
    entry: EntryKey,
    rule: Arc<str>,
    params: Params,
}

impl RuleNode {
    /// The compiled entry
    #[must_use]
    pub const fn entry(&self) -> &EntryKey {
        &self.entry
    }

    /// Name of the rule
    #[must_use]
    pub fn rule(&self) -> &str {
        &self.rule
    }

    /// Values of the params the entry uses
    #[must_use]
    pub const fn params(&self) -> &Params {
        &self.params
    }
}

/// A process request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessNode {
    process: Arc<Process>,
}

impl ProcessNode {
    pub(crate) fn new(process: Process) -> Self {
        Self {
            process: Arc::new(process),
        }
    }

    /// The request
    #[must_use]
    pub fn process(&self) -> &Process {
        &self.process
    }
}

/// A workspace read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobNode {
    globs: Arc<PathGlobs>,
}

impl GlobNode {
    pub(crate) fn new(globs: PathGlobs) -> Self {
        Self {
            globs: Arc::new(globs),
        }
    }

    /// The globs
    #[must_use]
    pub fn globs(&self) -> &PathGlobs {
        &self.globs
    }
}

impl NodeKey {
    /// Name of the rule, for rule nodes
    #[must_use]
    pub fn rule_name(&self) -> Option<&str> {
        match self {
            Self::Rule(node) => Some(node.rule()),
            Self::Process(_) | Self::Glob(_) => None,
        }
    }

    /// The request, for process nodes
    #[must_use]
    pub fn process(&self) -> Option<&Process> {
        match self {
            Self::Process(node) => Some(node.process()),
            Self::Rule(_) | Self::Glob(_) => None,
        }
    }

    /// The globs, for workspace reads
    #[must_use]
    pub fn path_globs(&self) -> Option<&PathGlobs> {
        match self {
            Self::Glob(node) => Some(node.globs()),
            Self::Rule(_) | Self::Process(_) => None,
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule(node) => write!(f, "{}{}", node.rule, node.params),
            Self::Process(node) => write!(f, "Process({})", node.process.description),
            Self::Glob(node) => write!(f, "PathGlobs({})", node.globs.globs.join(", ")),
        }
    }
}

#[async_trait]
impl Node for NodeKey {
    type Item = Value;
    type Error = Failure;
    type Context = Arc<Core>;

    async fn run(self, context: Context<Self>) -> Result<Value, Failure> {
        match self {
            Self::Rule(node) => run_rule(node, context).await,
            Self::Process(node) => {
                let result = context.data().runner.run(node.process()).await?;
                Value::new(result)
            }
            Self::Glob(node) => {
                let core = Arc::clone(context.data());
                let snapshot =
                    blocking(move || core.workspace.snapshot(&core.store, node.globs())).await?;
                Value::new(snapshot)
            }
        }
    }
}

async fn run_rule(node: RuleNode, context: Context<NodeKey>) -> Result<Value, Failure> {
    let core = Arc::clone(context.data());
    let Some(entry) = core.rule_graph.entry(&node.entry) else {
        return Err(missing_entry(&node.entry));
    };
    let Resolution::Rule(resolution) = &entry.resolution else {
        return Err(Failure::Aborted {
            reason: format!("entry {} is satisfied by a param", node.entry),
        });
    };
    let Some(rule) = core.rule_graph.rule(resolution.rule) else {
        return Err(missing_entry(&node.entry));
    };

    let args = collect_all(
        join_all(
            resolution
                .dependencies
                .iter()
                .map(|dependency| resolve(&context, dependency, &node.params)),
        )
        .await,
    )?;

    emit_rule_started!(node.rule, rule.product());
    let started = Instant::now();
    let rule_context = RuleContext::new(
        context.clone(),
        node.entry.clone(),
        Arc::clone(&node.rule),
        node.params.clone(),
    );
    let result = match rule.run(rule_context, args) {
        Ok(running) => running.await,
        Err(failure) => Err(failure),
    };
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    emit_rule_completed!(node.rule, result.is_ok(), duration_ms);
    result
}

/// How a compiled entry is obtained for concrete params.
pub(crate) enum Target {
    Ready(Value),
    Node(NodeKey),
}

pub(crate) fn target(core: &Core, key: &EntryKey, params: &Params) -> Result<Target, Failure> {
    let entry = core
        .rule_graph
        .entry(key)
        .ok_or_else(|| missing_entry(key))?;
    match &entry.resolution {
        Resolution::Param(product) => params
            .get(*product)
            .cloned()
            .map(Target::Ready)
            .ok_or_else(|| Failure::Aborted {
                reason: format!("param {product} is not in scope for {key}"),
            }),
        Resolution::Rule(resolution) => {
            let rule = core
                .rule_graph
                .rule(resolution.rule)
                .ok_or_else(|| missing_entry(key))?;
            Ok(Target::Node(NodeKey::Rule(RuleNode {
                entry: key.clone(),
                rule: Arc::from(rule.name()),
                params: params.restrict(&entry.used_params),
            })))
        }
    }
}

/// Compute `key` for `params`, recording the dependency on the caller.
pub(crate) async fn resolve(
    context: &Context<NodeKey>,
    key: &EntryKey,
    params: &Params,
) -> Result<Value, Failure> {
    match target(context.data(), key, params)? {
        Target::Ready(value) => Ok(value),
        Target::Node(node) => context.get(node).await,
    }
}

fn missing_entry(key: &EntryKey) -> Failure {
    Failure::Aborted {
        reason: format!("entry {key} is not in the compiled rule graph"),
    }
}
