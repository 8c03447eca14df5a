//! Error types for the engine.
//!
//! [`Failure`] is what a rule or node produces at runtime. It is cloneable so
//! that a computation shared by several requests can hand the same failure to
//! each of them. [`Error`] is what the public API returns.

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use cairn_graph::NodeError;
use miette::Diagnostic;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// A runtime failure of a rule, Get or process.
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum Failure {
    /// A rule body returned an error
    #[error("Rule `{rule}` failed: {message}")]
    #[diagnostic(code(cairn::engine::rule))]
    Rule {
        /// Name of the failing rule
        rule: String,
        /// What went wrong
        message: String,
    },

    /// A rule issued a Get it did not declare
    #[error("Rule `{rule}` issued undeclared {get}")]
    #[diagnostic(
        code(cairn::engine::undeclared_get),
        help("Declare the Get when registering the rule with `.get::<Product, Input>()`")
    )]
    UndeclaredGet {
        /// Name of the calling rule
        rule: String,
        /// The Get, rendered as `Get(Product, Input)`
        get: String,
    },

    /// A value was not of the type it was requested as
    #[error("Type mismatch: expected {expected}, got {actual}")]
    #[diagnostic(code(cairn::engine::type_mismatch))]
    TypeMismatch {
        /// Requested type
        expected: String,
        /// Type actually held
        actual: String,
    },

    /// A node (transitively) requested itself
    #[error("Dependency cycle: {}", path.join(" -> "))]
    #[diagnostic(
        code(cairn::engine::cycle),
        help("A rule may only request itself through a Get with a different input")
    )]
    Cycle {
        /// Nodes on the cycle, starting and ending with the repeated node
        path: Vec<String>,
    },

    /// A process exited non-zero where success was required
    #[error("Process '{description}' failed with exit code {exit_code}{}", format_summary(summary))]
    #[diagnostic(
        code(cairn::engine::process_execution),
        help("Request a FallibleProcessResult to inspect failing processes instead")
    )]
    ProcessExecution {
        /// The process description
        description: String,
        /// Exit code of the process
        exit_code: i32,
        /// Tail of stdout and stderr
        summary: String,
    },

    /// A process ran past its timeout and was killed
    #[error("Process '{description}' timed out after {timeout_ms}ms")]
    #[diagnostic(code(cairn::engine::process_timeout))]
    ProcessTimeout {
        /// The process description
        description: String,
        /// The timeout that expired
        timeout_ms: u64,
    },

    /// A path glob was malformed, or matched nothing where a match was required
    #[error("{message}")]
    #[diagnostic(
        code(cairn::engine::glob),
        help("Globs are relative to the workspace root; prefix a glob with '!' to exclude")
    )]
    Glob {
        /// What went wrong
        message: String,
    },

    /// The content store failed
    #[error("Store error: {source}")]
    #[diagnostic(code(cairn::engine::store))]
    Store {
        /// The underlying store error
        #[source]
        source: Arc<cairn_store::Error>,
    },

    /// A filesystem or process spawn error
    #[error("I/O {operation} failed: {message}")]
    #[diagnostic(code(cairn::engine::io))]
    Io {
        /// What was being done
        operation: String,
        /// The underlying error, rendered
        message: String,
    },

    /// A value could not be serialized to compute its identity
    #[error("Cannot fingerprint value of type {type_name}: {message}")]
    #[diagnostic(
        code(cairn::engine::serialization),
        help("Param types must serialize deterministically; use BTreeMap rather than HashMap")
    )]
    Serialization {
        /// Type of the value
        type_name: String,
        /// Serializer error
        message: String,
    },

    /// The request was cancelled
    #[error("Cancelled")]
    #[diagnostic(code(cairn::engine::cancelled))]
    Cancelled,

    /// A node's task ended without a result
    #[error("Computation aborted: {reason}")]
    #[diagnostic(code(cairn::engine::aborted))]
    Aborted {
        /// Why the task ended
        reason: String,
    },

    /// Several failures from one MultiGet or request batch
    #[error("{} failures:{}", failures.len(), format_failures(failures))]
    #[diagnostic(code(cairn::engine::multiple))]
    Multiple {
        /// The individual failures
        #[related]
        failures: Vec<Self>,
    },
}

fn format_summary(summary: &str) -> String {
    if summary.is_empty() {
        String::new()
    } else {
        format!("\n\n{summary}")
    }
}

fn format_failures(failures: &[Failure]) -> String {
    failures.iter().map(|f| format!("\n  - {f}")).collect()
}

impl Failure {
    /// A rule failure with a message
    #[must_use]
    pub fn rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rule {
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// An I/O failure
    #[must_use]
    pub fn io(operation: impl Into<String>, error: &std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            message: error.to_string(),
        }
    }

    /// Combine failures: one stays as-is, several become [`Failure::Multiple`]
    #[must_use]
    pub fn aggregate(mut failures: Vec<Self>) -> Self {
        match failures.len() {
            0 => Self::Aborted {
                reason: "no failures to aggregate".to_string(),
            },
            1 => failures.remove(0),
            _ => Self::Multiple { failures },
        }
    }

    /// Every non-aggregate failure
    #[must_use]
    pub fn flatten(&self) -> Vec<&Self> {
        match self {
            Self::Multiple { failures } => failures.iter().flat_map(Self::flatten).collect(),
            other => vec![other],
        }
    }
}

impl From<cairn_store::Error> for Failure {
    fn from(error: cairn_store::Error) -> Self {
        Self::Store {
            source: Arc::new(error),
        }
    }
}

impl NodeError for Failure {
    fn cancelled() -> Self {
        Self::Cancelled
    }

    fn cycle(path: Vec<String>) -> Self {
        Self::Cycle { path }
    }

    fn aborted(reason: String) -> Self {
        Self::Aborted { reason }
    }

    fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Multiple { failures } => failures.iter().any(Self::is_cancelled),
            _ => false,
        }
    }
}

/// Errors returned by the engine's public API.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// The rule graph could not be compiled
    #[error(transparent)]
    #[diagnostic(transparent)]
    Compilation(#[from] cairn_rule_graph::Error),

    /// One or more root requests failed
    #[error("Execution failed: {}", describe_failures(failures))]
    #[diagnostic(code(cairn::engine::execution))]
    Execution {
        /// The failure of each failed root request
        #[related]
        failures: Vec<Failure>,
    },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(cairn::engine::config),
        help("Check the configuration file and CAIRN_* environment variables")
    )]
    Configuration {
        /// What is wrong
        message: String,
    },

    /// A store operation outside of any request failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] cairn_store::Error),

    /// I/O error
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(code(cairn::engine::io))]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path involved, if any
        path: Option<Box<Path>>,
        /// Operation that failed
        operation: String,
    },
}

fn describe_failures(failures: &[Failure]) -> String {
    match failures {
        [single] => single.to_string(),
        many => format!("{} requests failed", many.len()),
    }
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Wrap a single request failure
    #[must_use]
    pub fn execution(failure: Failure) -> Self {
        Self::Execution {
            failures: vec![failure],
        }
    }

    /// The runtime failures, if this is an execution error
    #[must_use]
    pub fn failures(&self) -> &[Failure] {
        match self {
            Self::Execution { failures } => failures,
            _ => &[],
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_single_is_unwrapped() {
        let failure = Failure::aggregate(vec![Failure::rule("r", "boom")]);
        assert!(matches!(failure, Failure::Rule { .. }));
    }

    #[test]
    fn test_aggregate_many_lists_each() {
        let failure = Failure::aggregate(vec![Failure::rule("a", "one"), Failure::Cancelled]);
        let message = failure.to_string();
        assert!(message.starts_with("2 failures:"));
        assert!(message.contains("Rule `a` failed: one"));
        assert!(message.contains("Cancelled"));
        assert_eq!(failure.flatten().len(), 2);
        assert!(failure.is_cancelled());
    }

    #[test]
    fn test_cycle_message() {
        let failure = Failure::cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(failure.to_string(), "Dependency cycle: a -> b -> a");
    }

    #[test]
    fn test_process_failure_includes_summary() {
        let failure = Failure::ProcessExecution {
            description: "compile".to_string(),
            exit_code: 2,
            summary: "stderr:\nerror".to_string(),
        };
        let message = failure.to_string();
        assert!(message.starts_with("Process 'compile' failed with exit code 2"));
        assert!(message.ends_with("stderr:\nerror"));
    }

    #[test]
    fn test_store_failure_keeps_source() {
        let failure: Failure = cairn_store::Error::invalid_digest("bad").into();
        assert!(failure.to_string().contains("Invalid digest: bad"));
        assert!(std::error::Error::source(&failure).is_some());
    }

    #[test]
    fn test_execution_error_single_failure_message() {
        let error = Error::execution(Failure::rule("r", "boom"));
        assert_eq!(error.to_string(), "Execution failed: Rule `r` failed: boom");
        assert_eq!(error.failures().len(), 1);
    }
}
