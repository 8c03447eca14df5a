//! The cairn rule-graph engine.
//!
//! Rules are async functions from typed params to a typed product. They are
//! compiled once into a static rule graph, then executed on demand: each
//! rule application is a memoized node, and rules request further values
//! with [`RuleContext::get`], [`RuleContext::get_all`] and [`multi_get!`].
//! Files flow through the content-addressed [`Store`](cairn_store::Store),
//! entering it from the workspace through [`PathGlobs`]; subprocesses run through the [`Process`] intrinsic and are cached across
//! sessions.
//!
//! # Example
//!
//! ```rust,ignore
//! use cairn_engine::{EngineConfig, Failure, Params, Rule, RuleContext, RuleSet, Scheduler, TypeKey};
//!
//! async fn greet(_ctx: RuleContext, name: Name) -> Result<Greeting, Failure> {
//!     Ok(Greeting(format!("hello {}", name.0)))
//! }
//!
//! let rules = RuleSet::builder()
//!     .rule(Rule::new("greet", greet))
//!     .query::<Greeting>([TypeKey::of::<Name>()])
//!     .build();
//! let scheduler = Scheduler::new(rules, EngineConfig::default())?;
//! let greeting: Greeting = scheduler
//!     .new_session()
//!     .execute(Params::of(Name("cairn".into()))?)
//!     .await?;
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod fs;
pub mod intrinsics;
pub mod nodes;
pub mod process;
pub mod rule;
pub mod scheduler;
pub mod session;
pub mod value;

pub use config::{EngineConfig, GraphConfig, ProcessConfig, StoreConfig, WorkspaceConfig};
pub use context::{MultiGetResults, RuleContext};
pub use error::{Error, Failure, Result};
pub use fs::{
    DigestEntries, DigestEntry, GlobExpansionConjunction, GlobMatchErrorBehavior, PathGlobs, Paths,
    Snapshot,
};
pub use intrinsics::{
    AddPrefix, CreateDigest, DigestContents, DigestSubset, FileSpec, MergeDigests, RemovePrefix,
};
pub use nodes::NodeKey;
pub use process::{
    FallibleProcessResult, Process, ProcessCacheScope, ProcessResult, ProcessResultMetadata,
    ProcessResultSource,
};
pub use rule::{Rule, RuleFn, RuleSet, RuleSetBuilder};
pub use scheduler::Scheduler;
pub use session::Session;
pub use value::{Param, Params, Value};

pub use cairn_graph::{GraphStats, InvalidationResult};
pub use cairn_rule_graph::TypeKey;
pub use cairn_store::{Digest, Store};

#[doc(hidden)]
pub mod __private {
    pub use futures;
}
