//! Memoization graph for the cairn rule engine.
//!
//! Every [`Node`] value is a memo key. Requesting a node either returns its
//! memoized result, joins the computation already in flight for it, or spawns
//! a new one; equal nodes are never computed concurrently. Requests made from
//! inside a running node through its [`Context`] record dependency edges, so
//! that invalidating a node marks everything computed from it dirty.
//!
//! Dirty entries are cleaned lazily: if every dependency still has the
//! [`Generation`] recorded at the last run, the previous value is reused
//! without running the node. A node's generation only moves when a rerun
//! produces a different value, so an unchanged recomputation stops
//! invalidation from propagating further.
//!
//! Computations are reference counted: each runs in its own tokio task, and
//! when every request waiting on it has been dropped the task is aborted.

mod context;
mod entry;
mod node;

pub use context::Context;
pub use entry::Generation;
pub use node::{EntryId, Node, NodeError};

use cairn_events::{emit_cache_hit, emit_eviction, emit_invalidation};
use entry::{Entry, NodeResult, Outcome, PendingFuture, RunToken, State};
use futures::FutureExt;
use futures::future::Shared;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace};

/// Counts of what happened to an [`invalidate_from_roots`](Graph::invalidate_from_roots) call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationResult {
    /// Entries matching the predicate, whose values were dropped
    pub cleared: usize,
    /// Transitive dependents marked dirty
    pub dirtied: usize,
}

/// Counters describing how requests were served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    /// Node bodies run
    pub runs: u64,
    /// Requests served from a memoized value or an in-flight computation
    pub hits: u64,
    /// Dirty entries reused without running
    pub cleanings: u64,
    /// Computations aborted because nothing was waiting on them
    pub cancellations: u64,
}

#[derive(Default)]
struct Counters {
    runs: AtomicU64,
    hits: AtomicU64,
    cleanings: AtomicU64,
    cancellations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> GraphStats {
        GraphStats {
            runs: self.runs.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            cleanings: self.cleanings.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }
}

struct Inner<N: Node> {
    nodes: HashMap<N, EntryId>,
    entries: HashMap<EntryId, Entry<N>>,
    next_id: u64,
    clock: u64,
}

impl<N: Node> Inner<N> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn ensure_entry(&mut self, node: N, now: u64) -> (EntryId, &mut Entry<N>) {
        let id = if let Some(&id) = self.nodes.get(&node) {
            id
        } else {
            let id = EntryId(self.next_id);
            self.next_id += 1;
            self.nodes.insert(node.clone(), id);
            id
        };
        let entry = self
            .entries
            .entry(id)
            .or_insert_with(|| Entry::new(node, now));
        entry.last_used = now;
        (id, entry)
    }

    fn name(&self, id: EntryId) -> String {
        self.entries
            .get(&id)
            .map_or_else(|| id.to_string(), |entry| entry.node.to_string())
    }

    /// If `to` is reachable from `from` through in-flight waits, the cycle
    /// `to -> from -> ... -> to` rendered by node name.
    fn cycle_path(&self, from: EntryId, to: EntryId) -> Option<Vec<String>> {
        let mut parents: HashMap<EntryId, EntryId> = HashMap::new();
        let mut seen = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![current];
                let mut cursor = current;
                while let Some(&parent) = parents.get(&cursor) {
                    path.push(parent);
                    cursor = parent;
                }
                path.reverse();
                let mut names = vec![self.name(to)];
                names.extend(path.into_iter().map(|id| self.name(id)));
                return Some(names);
            }
            if let Some(entry) = self.entries.get(&current) {
                for &next in entry.waiting_on.keys() {
                    if seen.insert(next) {
                        parents.insert(next, current);
                        queue.push_back(next);
                    }
                }
            }
        }
        None
    }

    fn relink(
        &mut self,
        id: EntryId,
        old: &[(EntryId, Generation)],
        new: &[(EntryId, Generation)],
    ) {
        for (dependency, _) in old {
            if let Some(entry) = self.entries.get_mut(dependency) {
                entry.dependents.remove(&id);
            }
        }
        for (dependency, _) in new {
            if let Some(entry) = self.entries.get_mut(dependency) {
                entry.dependents.insert(id);
            }
        }
    }

    /// Mark every transitive dependent of `roots` dirty, skipping `skip`.
    fn dirty_dependents(&mut self, roots: &[EntryId], skip: &HashSet<EntryId>) -> usize {
        let mut stack: Vec<EntryId> = roots
            .iter()
            .filter_map(|id| self.entries.get(id))
            .flat_map(|entry| entry.dependents.iter().copied())
            .collect();
        let mut seen = HashSet::new();
        let mut dirtied = 0;
        while let Some(id) = stack.pop() {
            if skip.contains(&id) || !seen.insert(id) {
                continue;
            }
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.dirty() {
                    dirtied += 1;
                }
                stack.extend(entry.dependents.iter().copied());
            }
        }
        dirtied
    }

    fn remove(&mut self, id: EntryId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        self.nodes.remove(&entry.node);
        for (dependency, _) in &entry.dependencies {
            if let Some(dependency) = self.entries.get_mut(dependency) {
                dependency.dependents.remove(&id);
            }
        }
    }
}

struct GraphState<N: Node> {
    inner: Mutex<Inner<N>>,
    stats: Counters,
}

impl<N: Node> GraphState<N> {
    fn lock(&self) -> MutexGuard<'_, Inner<N>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A memoization graph of `N` nodes. Cloning is cheap and shares the graph.
pub struct Graph<N: Node> {
    state: Arc<GraphState<N>>,
}

impl<N: Node> Clone for Graph<N> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<N: Node> Default for Graph<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Node> Graph<N> {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(GraphState {
                inner: Mutex::new(Inner {
                    nodes: HashMap::new(),
                    entries: HashMap::new(),
                    next_id: 0,
                    clock: 0,
                }),
                stats: Counters::default(),
            }),
        }
    }

    /// Request `node` from outside any running node.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the node's error
    pub async fn get(&self, node: N, data: &N::Context) -> Result<N::Item, N::Error> {
        let (_, (result, _)) = self.request(None, node, data).await?;
        result
    }

    pub(crate) async fn request(
        &self,
        caller: Option<EntryId>,
        node: N,
        data: &N::Context,
    ) -> Result<(EntryId, Outcome<N>), N::Error> {
        let (id, pending) = {
            let mut inner = self.state.lock();
            let now = inner.tick();

            if let (Some(caller), Some(&existing)) = (caller, inner.nodes.get(&node)) {
                if let Some(path) = inner.cycle_path(existing, caller) {
                    debug!(cycle = %path.join(" -> "), "Dependency cycle detected");
                    return Err(N::Error::cycle(path));
                }
            }

            let (id, entry) = inner.ensure_entry(node, now);
            let joined = match &entry.state {
                State::Completed {
                    result,
                    dirty: false,
                } => {
                    Counters::bump(&self.state.stats.hits);
                    emit_cache_hit!("memo", entry.node);
                    return Ok((id, (result.clone(), entry.generation)));
                }
                State::Running {
                    pending: Some(weak),
                    ..
                } => weak.upgrade(),
                _ => None,
            };
            let pending = if let Some(pending) = joined {
                Counters::bump(&self.state.stats.hits);
                pending
            } else {
                self.start_run(entry, id, data.clone())
            };

            if let Some(caller) = caller {
                if let Some(waiter) = inner.entries.get_mut(&caller) {
                    *waiter.waiting_on.entry(id).or_insert(0) += 1;
                }
            }
            (id, pending)
        };

        let _wait = caller.map(|caller| WaitGuard {
            state: Arc::downgrade(&self.state),
            caller,
            callee: id,
        });
        Ok((id, pending.await))
    }

    fn start_run(
        &self,
        entry: &mut Entry<N>,
        id: EntryId,
        data: N::Context,
    ) -> Shared<PendingFuture<N>> {
        let (previous, cleaning) =
            match std::mem::replace(&mut entry.state, State::NotStarted { previous: None }) {
                State::Completed {
                    result,
                    dirty: true,
                } => (
                    Some(result.clone()),
                    Some(Cleaning {
                        dependencies: entry.dependencies.clone(),
                        previous: result,
                        generation: entry.generation,
                    }),
                ),
                State::Completed { result, .. } => (Some(result), None),
                State::NotStarted { previous } | State::Running { previous, .. } => {
                    (previous, None)
                }
            };

        entry.run_token = entry.run_token.next();
        trace!(node = %entry.node, cleaning = cleaning.is_some(), "Starting run");
        let run = Run {
            graph: self.clone(),
            id,
            token: entry.run_token,
            node: entry.node.clone(),
            data,
            cleaning,
        };

        let handle = AbortOnDropHandle::new(tokio::spawn(run.execute()));
        let pending = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(error) => (
                    Err(N::Error::aborted(error.to_string())),
                    Generation::default(),
                ),
            }
        }
        .boxed()
        .shared();

        entry.state = State::Running {
            pending: pending.downgrade(),
            previous,
            dirty: false,
        };
        pending
    }

    /// Request each recorded dependency; true if none changed generation.
    async fn dependencies_unchanged(
        &self,
        context: &Context<N>,
        dependencies: &[(EntryId, Generation)],
    ) -> bool {
        for &(dependency, generation) in dependencies {
            let node = self
                .state
                .lock()
                .entries
                .get(&dependency)
                .map(|entry| entry.node.clone());
            let Some(node) = node else {
                return false;
            };
            match self.request(context.entry(), node, context.data()).await {
                Ok((id, (_, current))) if id == dependency && current == generation => {}
                _ => return false,
            }
        }
        true
    }

    fn complete(
        &self,
        id: EntryId,
        token: RunToken,
        result: NodeResult<N>,
        dependencies: Vec<(EntryId, Generation)>,
    ) -> Outcome<N> {
        let mut inner = self.state.lock();
        let Some(entry) = inner.entries.get_mut(&id) else {
            return (result, Generation::default());
        };
        if entry.run_token != token {
            trace!(node = %entry.node, "Discarding result of a superseded run");
            return (result, entry.generation);
        }

        let (previous, dirty) =
            match std::mem::replace(&mut entry.state, State::NotStarted { previous: None }) {
                State::Running {
                    previous, dirty, ..
                } => (previous, dirty),
                State::NotStarted { previous } => (previous, false),
                State::Completed { result, dirty } => (Some(result), dirty),
            };

        if matches!(&result, Err(error) if error.is_cancelled()) {
            entry.state = State::NotStarted { previous };
            return (result, entry.generation);
        }

        let unchanged = matches!((&previous, &result), (Some(Ok(old)), Ok(new)) if old == new);
        if !unchanged {
            entry.generation = entry.generation.next();
        }
        let generation = entry.generation;
        entry.state = State::Completed {
            result: result.clone(),
            dirty,
        };
        let old = std::mem::replace(&mut entry.dependencies, dependencies.clone());
        inner.relink(id, &old, &dependencies);
        (result, generation)
    }

    fn complete_clean(&self, id: EntryId, token: RunToken, cleaning: Cleaning<N>) -> Outcome<N> {
        Counters::bump(&self.state.stats.cleanings);
        let mut inner = self.state.lock();
        if let Some(entry) = inner.entries.get_mut(&id) {
            if entry.run_token == token {
                let dirty = matches!(entry.state, State::Running { dirty: true, .. });
                trace!(node = %entry.node, "Reusing value of a dirty entry");
                entry.state = State::Completed {
                    result: cleaning.previous.clone(),
                    dirty,
                };
                return (cleaning.previous, entry.generation);
            }
        }
        (cleaning.previous, cleaning.generation)
    }

    /// Clear every entry matching `predicate` and mark their transitive
    /// dependents dirty.
    pub fn invalidate_from_roots<P: Fn(&N) -> bool>(&self, predicate: P) -> InvalidationResult {
        let mut inner = self.state.lock();
        let roots: Vec<EntryId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| predicate(&entry.node))
            .map(|(id, _)| *id)
            .collect();
        for id in &roots {
            if let Some(entry) = inner.entries.get_mut(id) {
                entry.clear();
            }
        }
        let skip: HashSet<EntryId> = roots.iter().copied().collect();
        let result = InvalidationResult {
            cleared: roots.len(),
            dirtied: inner.dirty_dependents(&roots, &skip),
        };
        drop(inner);

        emit_invalidation!(result.cleared, result.dirtied);
        result
    }

    /// Remove least recently used entries until at most `max_entries` remain.
    ///
    /// Running entries are never evicted. Dependents of evicted entries are
    /// marked dirty, and rerun on their next request. Returns the number of
    /// entries removed.
    pub fn evict_lru(&self, max_entries: usize) -> usize {
        let mut inner = self.state.lock();
        let excess = inner.entries.len().saturating_sub(max_entries);
        if excess == 0 {
            return 0;
        }

        let mut candidates: Vec<(u64, EntryId)> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_running())
            .map(|(id, entry)| (entry.last_used, *id))
            .collect();
        candidates.sort_unstable();
        let victims: Vec<EntryId> = candidates.into_iter().take(excess).map(|(_, id)| id).collect();

        let skip: HashSet<EntryId> = victims.iter().copied().collect();
        let dirtied = inner.dirty_dependents(&victims, &skip);
        for id in &victims {
            inner.remove(*id);
        }
        drop(inner);

        debug!(evicted = victims.len(), dirtied, "Evicted memo entries");
        emit_eviction!(victims.len());
        victims.len()
    }

    /// Drop every entry. In-flight computations finish for their current
    /// waiters but are not memoized.
    pub fn clear(&self) {
        let mut inner = self.state.lock();
        inner.entries.clear();
        inner.nodes.clear();
    }

    /// The clean memoized result for `node`, if there is one
    #[must_use]
    pub fn peek(&self, node: &N) -> Option<Result<N::Item, N::Error>> {
        let inner = self.state.lock();
        let id = inner.nodes.get(node)?;
        match &inner.entries.get(id)?.state {
            State::Completed {
                result,
                dirty: false,
            } => Some(result.clone()),
            _ => None,
        }
    }

    /// The current generation of `node`, if it has an entry
    #[must_use]
    pub fn generation(&self, node: &N) -> Option<Generation> {
        let inner = self.state.lock();
        let id = inner.nodes.get(node)?;
        inner.entries.get(id).map(|entry| entry.generation)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the graph has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Request counters since the graph was created
    #[must_use]
    pub fn stats(&self) -> GraphStats {
        self.state.stats.snapshot()
    }
}

struct Cleaning<N: Node> {
    dependencies: Vec<(EntryId, Generation)>,
    previous: NodeResult<N>,
    generation: Generation,
}

struct Run<N: Node> {
    graph: Graph<N>,
    id: EntryId,
    token: RunToken,
    node: N,
    data: N::Context,
    cleaning: Option<Cleaning<N>>,
}

impl<N: Node> Run<N> {
    async fn execute(self) -> Outcome<N> {
        let Self {
            graph,
            id,
            token,
            node,
            data,
            cleaning,
        } = self;
        let mut guard = RunGuard {
            state: Arc::downgrade(&graph.state),
            id,
            token,
            armed: true,
        };
        let context = Context::new(graph.clone(), data, Some(id));

        let mut reusable = None;
        if let Some(cleaning) = cleaning {
            if graph
                .dependencies_unchanged(&context, &cleaning.dependencies)
                .await
            {
                reusable = Some(cleaning);
            }
        }

        let outcome = if let Some(cleaning) = reusable {
            graph.complete_clean(id, token, cleaning)
        } else {
            // Requests made while cleaning are not dependencies of the run.
            context.take_dependencies();
            Counters::bump(&graph.state.stats.runs);
            let result = node.run(context.clone()).await;
            graph.complete(id, token, result, context.take_dependencies())
        };
        guard.armed = false;
        outcome
    }
}

/// Resets the entry if its run is dropped before completing.
struct RunGuard<N: Node> {
    state: Weak<GraphState<N>>,
    id: EntryId,
    token: RunToken,
    armed: bool,
}

impl<N: Node> Drop for RunGuard<N> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(state) = self.state.upgrade() else {
            return;
        };
        Counters::bump(&state.stats.cancellations);
        let mut inner = state.lock();
        if let Some(entry) = inner.entries.get_mut(&self.id) {
            if entry.run_token == self.token {
                trace!(node = %entry.node, "Run cancelled");
                entry.clear();
            }
        }
    }
}

/// Removes an in-flight wait edge when the waiting request finishes or is dropped.
struct WaitGuard<N: Node> {
    state: Weak<GraphState<N>>,
    caller: EntryId,
    callee: EntryId,
}

impl<N: Node> Drop for WaitGuard<N> {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut inner = state.lock();
        if let Some(entry) = inner.entries.get_mut(&self.caller) {
            if let Some(count) = entry.waiting_on.get_mut(&self.callee) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    entry.waiting_on.remove(&self.callee);
                }
            }
        }
    }
}
