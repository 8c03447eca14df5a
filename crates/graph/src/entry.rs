//! Per-node bookkeeping.

use crate::node::{EntryId, Node};
use futures::future::{BoxFuture, WeakShared};
use std::collections::{HashMap, HashSet};

/// A counter that moves only when a node's value changes.
///
/// Dependents record the generation they observed; a dirty dependent whose
/// recorded generations all still match can keep its value without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub(crate) u64);

impl Generation {
    pub(crate) const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Identifies one run of an entry. Clearing or restarting an entry moves the
/// token, and a run whose token no longer matches does not write back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct RunToken(u64);

impl RunToken {
    pub(crate) const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

pub(crate) type NodeResult<N> = Result<<N as Node>::Item, <N as Node>::Error>;

/// What a request observes: the result and the generation it was produced at.
pub(crate) type Outcome<N> = (NodeResult<N>, Generation);

pub(crate) type PendingFuture<N> = BoxFuture<'static, Outcome<N>>;

pub(crate) enum State<N: Node> {
    /// Never run, or cleared. `previous` is kept only to compute the next
    /// generation; it is not a valid value.
    NotStarted { previous: Option<NodeResult<N>> },
    /// A run is in flight. Waiters hold the strong side of `pending`; when
    /// the last one goes away the run is aborted.
    Running {
        pending: Option<WeakShared<PendingFuture<N>>>,
        previous: Option<NodeResult<N>>,
        dirty: bool,
    },
    /// A finished run. A dirty result must be cleaned before it is reused.
    Completed { result: NodeResult<N>, dirty: bool },
}

pub(crate) struct Entry<N: Node> {
    pub node: N,
    pub state: State<N>,
    pub generation: Generation,
    pub run_token: RunToken,
    /// Dependencies observed by the last completed run, with their generations
    pub dependencies: Vec<(EntryId, Generation)>,
    /// Entries whose last run depended on this one
    pub dependents: HashSet<EntryId>,
    /// Entries this one is currently awaiting, with the number of waits
    pub waiting_on: HashMap<EntryId, usize>,
    pub last_used: u64,
}

impl<N: Node> Entry<N> {
    pub fn new(node: N, now: u64) -> Self {
        Self {
            node,
            state: State::NotStarted { previous: None },
            generation: Generation::default(),
            run_token: RunToken::default(),
            dependencies: Vec::new(),
            dependents: HashSet::new(),
            waiting_on: HashMap::new(),
            last_used: now,
        }
    }

    pub const fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Mark a clean result dirty. Returns whether anything changed.
    pub fn dirty(&mut self) -> bool {
        match &mut self.state {
            State::Completed { dirty, .. } | State::Running { dirty, .. } if !*dirty => {
                *dirty = true;
                true
            }
            _ => false,
        }
    }

    /// Drop the value, keeping it only as the baseline for the next generation.
    pub fn clear(&mut self) {
        let previous = match std::mem::replace(&mut self.state, State::NotStarted { previous: None }) {
            State::NotStarted { previous } | State::Running { previous, .. } => previous,
            State::Completed { result, .. } => Some(result),
        };
        self.state = State::NotStarted { previous };
        self.run_token = self.run_token.next();
    }
}
