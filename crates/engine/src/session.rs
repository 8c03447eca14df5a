//! Sessions: the scope of a batch of root requests.

use crate::context::collect_all;
use crate::error::{Error, Failure, Result};
use crate::nodes::{NodeKey, ProcessNode, Target, target};
use crate::process::{FallibleProcessResult, Process};
use crate::scheduler::Core;
use crate::value::{Param, Params, Value};
use cairn_events::{emit_request_completed, emit_request_started};
use cairn_rule_graph::TypeKey;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

/// A handle for issuing root requests.
///
/// Sessions of one scheduler share memoized results. Cancelling a session
/// fails its pending requests with [`Failure::Cancelled`]; computations they
/// share with other sessions keep running. Clones share the cancellation
/// state.
#[derive(Clone)]
pub struct Session {
    core: Arc<Core>,
    id: Uuid,
    cancellation: CancellationToken,
}

impl Session {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            id: Uuid::new_v4(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Unique id of this session
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Compute a `P` from `params`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compilation`] if no query for `P` with exactly these
    /// param types was declared, or [`Error::Execution`] if the computation
    /// failed or the session was cancelled
    pub async fn execute<P: Param>(&self, params: Params) -> Result<P> {
        let product = TypeKey::of::<P>();
        let (key, _) = self.core.rule_graph.find_root(product, &params.types())?;
        let root = target(&self.core, key, &params).map_err(Error::execution)?;

        emit_request_started!(product);
        let started = Instant::now();
        let result = match root {
            Target::Ready(value) => Ok(value),
            Target::Node(node) => self.request(node).await,
        }
        .and_then(|value| value.downcast::<P>());
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        emit_request_completed!(product, result.is_ok(), duration_ms);

        self.enforce_bound();
        result.map_err(Error::execution)
    }

    /// Compute a `P` for each set of params concurrently. Results are in
    /// request order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compilation`] for an undeclared query, or
    /// [`Error::Execution`] carrying the failure of every failed request
    pub async fn execute_all<P: Param>(&self, requests: Vec<Params>) -> Result<Vec<P>> {
        let results = join_all(requests.into_iter().map(|params| self.execute::<P>(params))).await;
        let mut values = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(value) => values.push(value),
                Err(Error::Execution { failures: mut failed }) => failures.append(&mut failed),
                Err(other) => return Err(other),
            }
        }
        if failures.is_empty() {
            Ok(values)
        } else {
            Err(Error::Execution { failures })
        }
    }

    /// Run a process directly, through the memo graph and the action cache
    ///
    /// # Errors
    ///
    /// Returns [`Error::Execution`] if the process could not be run or timed
    /// out. A non-zero exit is reported in the result, not as an error.
    pub async fn run_process(&self, process: Process) -> Result<FallibleProcessResult> {
        let node = NodeKey::Process(ProcessNode::new(process));
        self.request(node)
            .await
            .and_then(|value| value.downcast::<FallibleProcessResult>())
            .map_err(Error::execution)
    }

    /// Run several processes concurrently. Results are in request order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Execution`] with every failure
    pub async fn run_processes(&self, processes: Vec<Process>) -> Result<Vec<FallibleProcessResult>> {
        let results = join_all(processes.into_iter().map(|process| async move {
            self.request(NodeKey::Process(ProcessNode::new(process)))
                .await
                .and_then(|value| value.downcast::<FallibleProcessResult>())
        }))
        .await;
        collect_all(results).map_err(|failure| Error::Execution {
            failures: failure.flatten().into_iter().cloned().collect(),
        })
    }

    /// Cancel every pending request of this session
    pub fn cancel(&self) {
        debug!(session = %self.id, "Cancelling session");
        self.cancellation.cancel();
    }

    /// Whether [`cancel`](Self::cancel) was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    async fn request(&self, node: NodeKey) -> std::result::Result<Value, Failure> {
        if self.cancellation.is_cancelled() {
            return Err(Failure::Cancelled);
        }
        let span = info_span!("request", session = %self.id, node = %node);
        let computing = self.core.graph.get(node, &self.core).instrument(span);
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(Failure::Cancelled),
            result = computing => result,
        }
    }

    fn enforce_bound(&self) {
        let max_entries = self.core.config.graph.max_entries;
        if max_entries > 0 {
            self.core.graph.evict_lru(max_entries);
        }
    }
}
