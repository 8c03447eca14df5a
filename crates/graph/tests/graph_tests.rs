//! Behaviour of the memo graph under concurrency, invalidation and eviction.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use cairn_graph::{Context, Graph, Node, NodeError};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
enum TestError {
    #[error("cancelled")]
    Cancelled,
    #[error("cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("failed: {0}")]
    Failed(String),
}

impl NodeError for TestError {
    fn cancelled() -> Self {
        Self::Cancelled
    }
    fn cycle(path: Vec<String>) -> Self {
        Self::Cycle(path)
    }
    fn aborted(reason: String) -> Self {
        Self::Aborted(reason)
    }
    fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TestNode {
    /// Reads a mutable input
    Leaf(&'static str),
    /// Sums its children
    Sum(Vec<TestNode>),
    /// `child % 2`
    Parity(Box<TestNode>),
    /// `child * 10`
    Scale(Box<TestNode>),
    /// Waits until the gate opens
    Gate,
    /// Requests `Cycle((n + 1) % 2)`
    Cycle(u8),
    /// Requests itself
    SelfLoop,
    /// Always fails
    Fail,
}

impl fmt::Display for TestNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf(name) => write!(f, "leaf-{name}"),
            Self::Sum(children) => write!(f, "sum-{}", children.len()),
            Self::Parity(child) => write!(f, "parity({child})"),
            Self::Scale(child) => write!(f, "scale({child})"),
            Self::Gate => write!(f, "gate"),
            Self::Cycle(n) => write!(f, "cycle-{n}"),
            Self::SelfLoop => write!(f, "self-loop"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

struct TestState {
    inputs: Mutex<HashMap<&'static str, i64>>,
    runs: Mutex<HashMap<String, usize>>,
    gate: watch::Sender<bool>,
}

impl TestState {
    fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(false);
        Arc::new(Self {
            inputs: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            gate,
        })
    }

    fn set(&self, name: &'static str, value: i64) {
        self.inputs.lock().unwrap().insert(name, value);
    }

    fn runs(&self, node: &TestNode) -> usize {
        self.runs
            .lock()
            .unwrap()
            .get(&node.to_string())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Node for TestNode {
    type Item = i64;
    type Error = TestError;
    type Context = Arc<TestState>;

    async fn run(self, context: Context<Self>) -> Result<i64, TestError> {
        let state = Arc::clone(context.data());
        *state.runs.lock().unwrap().entry(self.to_string()).or_insert(0) += 1;
        match self {
            Self::Leaf(name) => Ok(state.inputs.lock().unwrap().get(name).copied().unwrap_or(0)),
            Self::Sum(children) => {
                let mut total = 0;
                for child in children {
                    total += context.get(child).await?;
                }
                Ok(total)
            }
            Self::Parity(child) => Ok(context.get(*child).await? % 2),
            Self::Scale(child) => Ok(context.get(*child).await? * 10),
            Self::Gate => {
                let mut open = state.gate.subscribe();
                open.wait_for(|open| *open)
                    .await
                    .map_err(|_| TestError::Cancelled)?;
                Ok(1)
            }
            Self::Cycle(n) => context.get(Self::Cycle((n + 1) % 2)).await,
            Self::SelfLoop => context.get(Self::SelfLoop).await,
            Self::Fail => Err(TestError::Failed("always".to_string())),
        }
    }
}

fn leaf(name: &'static str) -> TestNode {
    TestNode::Leaf(name)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_composed_value_is_memoized() {
    let graph = Graph::new();
    let state = TestState::new();
    state.set("a", 1);
    state.set("b", 2);
    let sum = TestNode::Sum(vec![leaf("a"), leaf("b")]);

    assert_eq!(assert_ok!(graph.get(sum.clone(), &state).await), 3);
    assert_eq!(assert_ok!(graph.get(sum.clone(), &state).await), 3);

    assert_eq!(state.runs(&sum), 1);
    assert_eq!(state.runs(&leaf("a")), 1);
    assert_eq!(graph.len(), 3);
    assert_eq!(graph.peek(&sum), Some(Ok(3)));
    assert!(graph.stats().hits >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_run_once() {
    let graph = Graph::new();
    let state = TestState::new();

    let requests: Vec<_> = (0..16)
        .map(|_| {
            let graph = graph.clone();
            let state = Arc::clone(&state);
            tokio::spawn(async move { graph.get(TestNode::Gate, &state).await })
        })
        .collect();

    wait_until(|| state.runs(&TestNode::Gate) == 1).await;
    state.gate.send_replace(true);

    for request in requests {
        assert_eq!(request.await.unwrap(), Ok(1));
    }
    assert_eq!(state.runs(&TestNode::Gate), 1);
    assert_eq!(graph.stats().runs, 1);
}

#[tokio::test]
async fn test_invalidation_reruns_dependents() {
    let graph = Graph::new();
    let state = TestState::new();
    state.set("a", 1);
    state.set("b", 2);
    let sum = TestNode::Sum(vec![leaf("a"), leaf("b")]);
    assert_eq!(graph.get(sum.clone(), &state).await, Ok(3));

    state.set("a", 5);
    let result = graph.invalidate_from_roots(|node| *node == leaf("a"));
    assert_eq!(result.cleared, 1);
    assert_eq!(result.dirtied, 1);
    assert_eq!(graph.peek(&sum), None);

    assert_eq!(graph.get(sum.clone(), &state).await, Ok(7));
    assert_eq!(state.runs(&sum), 2);
    assert_eq!(state.runs(&leaf("a")), 2);
    assert_eq!(state.runs(&leaf("b")), 1);
}

#[tokio::test]
async fn test_unchanged_recomputation_cuts_off_dependents() {
    let graph = Graph::new();
    let state = TestState::new();
    state.set("a", 1);
    let parity = TestNode::Parity(Box::new(leaf("a")));
    let scaled = TestNode::Scale(Box::new(parity.clone()));
    assert_eq!(graph.get(scaled.clone(), &state).await, Ok(10));
    let parity_generation = graph.generation(&parity).unwrap();

    state.set("a", 3);
    let result = graph.invalidate_from_roots(|node| *node == leaf("a"));
    assert_eq!(result.dirtied, 2);

    assert_eq!(graph.get(scaled.clone(), &state).await, Ok(10));
    assert_eq!(state.runs(&leaf("a")), 2);
    assert_eq!(state.runs(&parity), 2);
    assert_eq!(state.runs(&scaled), 1);
    assert_eq!(graph.generation(&parity), Some(parity_generation));
    assert!(graph.stats().cleanings >= 1);
}

#[tokio::test]
async fn test_changed_value_moves_generation() {
    let graph = Graph::new();
    let state = TestState::new();
    state.set("a", 1);
    graph.get(leaf("a"), &state).await.unwrap();
    let before = graph.generation(&leaf("a")).unwrap();

    state.set("a", 2);
    graph.invalidate_from_roots(|node| *node == leaf("a"));
    graph.get(leaf("a"), &state).await.unwrap();
    assert!(graph.generation(&leaf("a")).unwrap() > before);
}

#[tokio::test]
async fn test_cycle_is_reported_with_path() {
    let graph = Graph::new();
    let state = TestState::new();

    let err = assert_err!(graph.get(TestNode::Cycle(0), &state).await);
    assert_eq!(
        err,
        TestError::Cycle(vec![
            "cycle-1".to_string(),
            "cycle-0".to_string(),
            "cycle-1".to_string(),
        ])
    );

    let err = assert_err!(graph.get(TestNode::SelfLoop, &state).await);
    assert_eq!(
        err,
        TestError::Cycle(vec!["self-loop".to_string(), "self-loop".to_string()])
    );
}

#[tokio::test]
async fn test_failures_are_memoized() {
    let graph = Graph::new();
    let state = TestState::new();
    assert_err!(graph.get(TestNode::Fail, &state).await);
    assert_err!(graph.get(TestNode::Fail, &state).await);
    assert_eq!(state.runs(&TestNode::Fail), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_only_request_cancels_computation() {
    let graph = Graph::new();
    let state = TestState::new();

    let request = {
        let graph = graph.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move { graph.get(TestNode::Gate, &state).await })
    };
    wait_until(|| state.runs(&TestNode::Gate) == 1).await;

    request.abort();
    wait_until(|| graph.stats().cancellations == 1).await;
    assert_eq!(graph.peek(&TestNode::Gate), None);

    state.gate.send_replace(true);
    assert_eq!(graph.get(TestNode::Gate, &state).await, Ok(1));
    assert_eq!(state.runs(&TestNode::Gate), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_computation_survives_one_cancellation() {
    let graph = Graph::new();
    let state = TestState::new();

    let spawn_request = || {
        let graph = graph.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move { graph.get(TestNode::Gate, &state).await })
    };
    let first = spawn_request();
    let second = spawn_request();
    wait_until(|| state.runs(&TestNode::Gate) == 1 && graph.stats().hits == 1).await;

    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    state.gate.send_replace(true);
    assert_eq!(second.await.unwrap(), Ok(1));
    assert_eq!(state.runs(&TestNode::Gate), 1);
    assert_eq!(graph.stats().cancellations, 0);
}

#[tokio::test]
async fn test_eviction_removes_oldest_and_dirties_dependents() {
    let graph = Graph::new();
    let state = TestState::new();
    state.set("a", 1);
    state.set("b", 2);
    let sum = TestNode::Sum(vec![leaf("a")]);

    graph.get(sum.clone(), &state).await.unwrap();
    graph.get(leaf("b"), &state).await.unwrap();
    graph.get(sum.clone(), &state).await.unwrap();
    assert_eq!(graph.len(), 3);

    assert_eq!(graph.evict_lru(2), 1);
    assert_eq!(graph.len(), 2);
    assert_eq!(graph.peek(&leaf("a")), None);
    assert_eq!(graph.peek(&sum), None);

    assert_eq!(graph.get(sum.clone(), &state).await, Ok(1));
    assert_eq!(state.runs(&sum), 2);
    assert_eq!(graph.evict_lru(10), 0);
}

#[tokio::test]
async fn test_clear_drops_everything() {
    let graph = Graph::new();
    let state = TestState::new();
    graph.get(leaf("a"), &state).await.unwrap();
    assert!(!graph.is_empty());
    graph.clear();
    assert!(graph.is_empty());
    graph.get(leaf("a"), &state).await.unwrap();
    assert_eq!(state.runs(&leaf("a")), 2);
}
