//! Error types for rule graph compilation.

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Result type for rule graph operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors found while compiling a rule graph.
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum Error {
    /// No registered rule can produce the product in the given scope.
    #[error("No rule to compute {product} with params {params}{}", format_reasons(reasons))]
    #[diagnostic(
        code(cairn::rule_graph::no_rule),
        help("Register a rule that produces {product}, or add the missing type to the query's params")
    )]
    NoRule {
        /// Product that could not be computed
        product: String,
        /// Params in scope, rendered as `(A, B)`
        params: String,
        /// Why each candidate rule was rejected
        reasons: Vec<String>,
    },

    /// More than one rule can produce the product in the given scope.
    #[error("Ambiguous rules to compute {product} with params {params}: {}", candidates.join(", "))]
    #[diagnostic(
        code(cairn::rule_graph::ambiguous),
        help("Remove one of the rules, or give them distinct input types")
    )]
    Ambiguous {
        /// Product with several producers
        product: String,
        /// Params in scope, rendered as `(A, B)`
        params: String,
        /// Names of every applicable rule
        candidates: Vec<String>,
    },

    /// A root request did not match any query declared at compile time.
    #[error("No query was declared for {product} with params {params}")]
    #[diagnostic(
        code(cairn::rule_graph::no_query),
        help("Declare the query when building the rule set")
    )]
    NoQuery {
        /// Requested product
        product: String,
        /// Supplied params, rendered as `(A, B)`
        params: String,
    },

    /// Several errors, reported together.
    #[error("{} errors while compiling the rule graph", errors.len())]
    #[diagnostic(code(cairn::rule_graph::multiple))]
    Multiple {
        /// The individual errors
        #[related]
        errors: Vec<Self>,
    },
}

fn format_reasons(reasons: &[String]) -> String {
    reasons.iter().map(|r| format!("\n  - {r}")).collect()
}

impl Error {
    /// Collapse a list of errors: one stays as-is, several become [`Error::Multiple`]
    #[must_use]
    pub fn from_many(mut errors: Vec<Self>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple { errors }),
        }
    }

    /// Every non-aggregate error
    #[must_use]
    pub fn flatten(&self) -> Vec<&Self> {
        match self {
            Self::Multiple { errors } => errors.iter().flat_map(Self::flatten).collect(),
            other => vec![other],
        }
    }
}
