//! Event type definitions for structured engine events.
//!
//! Events are categorized by the engine component that produced them and carry
//! an id, the session correlation id and a timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A structured engine event with full metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// Correlation ID shared by every event of a process.
    pub correlation_id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// The tracing target that emitted the event (e.g. "`cairn::rule`").
    pub target: String,
    /// The event category and data.
    pub category: EventCategory,
}

impl EngineEvent {
    /// Create a new event with the given category.
    #[must_use]
    pub fn new(correlation_id: Uuid, target: impl Into<String>, category: EventCategory) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            timestamp: Utc::now(),
            target: target.into(),
            category,
        }
    }
}

/// Event categories organized by component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventCategory {
    /// Rule execution lifecycle.
    Rule(RuleEvent),
    /// Memoization and action cache lookups.
    Cache(CacheEvent),
    /// Process execution lifecycle.
    Process(ProcessEvent),
    /// Content-addressed store maintenance.
    Store(StoreEvent),
    /// Memoization graph maintenance.
    Graph(GraphEvent),
    /// Root requests made through a session.
    Session(SessionEvent),
}

/// Rule execution lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RuleEvent {
    /// A rule body started running.
    Started {
        /// Rule name.
        rule: String,
        /// Product type the rule computes.
        product: String,
    },
    /// A rule body finished.
    Completed {
        /// Rule name.
        rule: String,
        /// Whether the rule produced a value.
        success: bool,
        /// Duration in milliseconds.
        duration_ms: u64,
    },
}

/// Cache lookup events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum CacheEvent {
    /// A cached result was reused.
    Hit {
        /// Which cache answered (e.g. "memo", "action").
        cache: String,
        /// Key that matched.
        key: String,
    },
    /// No cached result; the work will run.
    Miss {
        /// Which cache was consulted.
        cache: String,
        /// Key that was looked up.
        key: String,
    },
}

/// Process execution lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ProcessEvent {
    /// A child process was spawned.
    Started {
        /// Human readable description of the process.
        description: String,
        /// Command line.
        argv: Vec<String>,
    },
    /// A child process exited.
    Completed {
        /// Human readable description of the process.
        description: String,
        /// Whether the process exited with status 0.
        success: bool,
        /// Exit code, if the process was not killed by a signal.
        exit_code: Option<i32>,
        /// Duration in milliseconds.
        duration_ms: u64,
    },
    /// A child process was killed after exceeding its timeout.
    TimedOut {
        /// Human readable description of the process.
        description: String,
        /// The timeout that expired, in milliseconds.
        timeout_ms: u64,
    },
}

/// Store maintenance events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum StoreEvent {
    /// Garbage collection finished.
    GarbageCollected {
        /// Number of blobs removed.
        blobs_removed: usize,
        /// Bytes freed.
        bytes_freed: u64,
    },
}

/// Memoization graph maintenance events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum GraphEvent {
    /// Entries were invalidated.
    Invalidated {
        /// Entries whose values were discarded.
        cleared: usize,
        /// Dependents marked dirty.
        dirtied: usize,
    },
    /// Least recently used entries were evicted.
    Evicted {
        /// Number of entries evicted.
        count: usize,
    },
}

/// Session request events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    /// A root request started.
    RequestStarted {
        /// Product type requested.
        product: String,
    },
    /// A root request finished.
    RequestCompleted {
        /// Product type requested.
        product: String,
        /// Whether the request produced a value.
        success: bool,
        /// Duration in milliseconds.
        duration_ms: u64,
    },
}
