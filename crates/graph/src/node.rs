//! The trait computations implement to be memoized by the graph.

use crate::Context;
use async_trait::async_trait;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Identifies an entry in the graph. Ids are never reused, so a stale id
/// simply fails to resolve after its entry is evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u64);

impl Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A memoizable computation.
///
/// The node value is its own memo key: two equal nodes share one entry and
/// therefore one computation. A node requests other nodes through the
/// [`Context`] it is run with, which records the dependency edges used for
/// invalidation and cleaning.
#[async_trait]
pub trait Node: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static {
    /// Output of a successful run. Compared with the previous output to
    /// decide whether dependents can reuse their values.
    type Item: Clone + Debug + Eq + Send + Sync + 'static;

    /// Output of a failed run.
    type Error: NodeError;

    /// Caller-supplied state handed to every run (for example a session).
    type Context: Clone + Send + Sync + 'static;

    /// Compute the node's value.
    async fn run(self, context: Context<Self>) -> Result<Self::Item, Self::Error>;
}

/// Errors the graph itself needs to produce on a node's behalf.
pub trait NodeError: Clone + Debug + Send + Sync + 'static {
    /// The computation was cancelled before it produced a value
    fn cancelled() -> Self;

    /// The computation (transitively) requested itself; `path` names each
    /// node on the cycle, starting and ending with the repeated node
    fn cycle(path: Vec<String>) -> Self;

    /// The computation's task ended without producing a value
    fn aborted(reason: String) -> Self;

    /// Whether this error is a cancellation, which is never memoized
    fn is_cancelled(&self) -> bool;
}
