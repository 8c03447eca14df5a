//! The handle a running node uses to request other nodes.

use crate::entry::Generation;
use crate::node::{EntryId, Node};
use crate::Graph;
use std::sync::{Arc, Mutex, PoisonError};

/// Passed to [`Node::run`]. Every [`Context::get`] records a dependency edge
/// from the running entry to the requested one.
pub struct Context<N: Node> {
    graph: Graph<N>,
    data: N::Context,
    entry: Option<EntryId>,
    dependencies: Arc<Mutex<Vec<(EntryId, Generation)>>>,
}

impl<N: Node> Clone for Context<N> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            data: self.data.clone(),
            entry: self.entry,
            dependencies: Arc::clone(&self.dependencies),
        }
    }
}

impl<N: Node> Context<N> {
    pub(crate) fn new(graph: Graph<N>, data: N::Context, entry: Option<EntryId>) -> Self {
        Self {
            graph,
            data,
            entry,
            dependencies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Request `node`, waiting for it to be computed (or reusing its memoized
    /// value).
    ///
    /// # Errors
    ///
    /// Returns the node's error, or a cycle error if `node` is (transitively)
    /// waiting on the caller
    pub async fn get(&self, node: N) -> Result<N::Item, N::Error> {
        let (id, (result, generation)) = self.graph.request(self.entry, node, &self.data).await?;
        if self.entry.is_some() {
            self.dependencies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((id, generation));
        }
        result
    }

    /// Caller-supplied state
    pub const fn data(&self) -> &N::Context {
        &self.data
    }

    /// The graph this context belongs to
    pub const fn graph(&self) -> &Graph<N> {
        &self.graph
    }

    /// The entry being computed, if any
    #[must_use]
    pub const fn entry(&self) -> Option<EntryId> {
        self.entry
    }

    pub(crate) fn take_dependencies(&self) -> Vec<(EntryId, Generation)> {
        std::mem::take(&mut *self.dependencies.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
