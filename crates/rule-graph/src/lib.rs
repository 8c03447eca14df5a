//! Static rule graph compiler for the cairn engine.
//!
//! Given a set of rules (each producing one product type from positional
//! dependency types, and declaring the Gets it may issue) and a set of root
//! queries, the compiler decides ahead of execution which rule satisfies each
//! product in each param scope. Missing and ambiguous producers are reported
//! before anything runs.
//!
//! # Key Types
//!
//! - [`RuleGraph`]: the compiled plan
//! - [`RuleNodeData`]: what the compiler needs to know about a rule
//! - [`Query`]: a root request shape
//! - [`EntryKey`] / [`Entry`]: a product in a param scope and its resolution
//!
//! # Example
//!
//! ```ignore
//! use cairn_rule_graph::{Query, RuleGraph, TypeKey};
//!
//! let graph = RuleGraph::build(rules, vec![Query::new(TypeKey::of::<Binary>(), [TypeKey::of::<Target>()])])?;
//! let (root, entry) = graph.find_root(TypeKey::of::<Binary>(), &params)?;
//! ```

mod builder;
mod error;
mod graph;
mod types;
mod validation;

pub use builder::{Resolution, RuleResolution};
pub use error::{Error, Result};
pub use graph::{Entry, RuleGraph};
pub use types::{EntryKey, GetDeclaration, ParamTypes, Query, TypeKey, display_params};
pub use validation::GraphSummary;

/// Index of a rule in the order it was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub usize);

/// What the compiler needs to know about a rule.
pub trait RuleNodeData {
    /// Stable, human readable rule name
    fn name(&self) -> &str;

    /// The type this rule produces
    fn product(&self) -> TypeKey;

    /// Types of the rule's positional parameters, in order
    fn dependencies(&self) -> &[TypeKey];

    /// Gets the rule may issue while running
    fn gets(&self) -> &[GetDeclaration];

    /// Rules supplied by the engine itself are not reported as unreachable
    fn is_intrinsic(&self) -> bool {
        false
    }
}
