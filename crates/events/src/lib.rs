//! Structured event system for the cairn engine.
//!
//! Engine components emit events with the `emit_*` macros below. They are
//! ordinary `tracing` events (target `cairn::*`, plus an `event_type` field),
//! so they show up in regular logs. A [`CairnEventLayer`] installed in the
//! subscriber additionally turns them into typed [`EngineEvent`]s and forwards
//! them to an [`EventBus`], from which renderers such as [`JsonRenderer`]
//! consume them.
//!
//! ```rust,ignore
//! use cairn_events::{CairnEventLayer, EventBus, emit_rule_started};
//! use tracing_subscriber::layer::SubscriberExt;
//! use tracing_subscriber::util::SubscriberInitExt;
//!
//! let bus = EventBus::new();
//! let layer = CairnEventLayer::new(bus.sender().unwrap().into_inner());
//! tracing_subscriber::registry().with(layer).init();
//!
//! emit_rule_started!("compile", "Binary");
//! ```

pub mod bus;
pub mod event;
pub mod layer;
pub mod metadata;
pub mod renderers;

pub use bus::{EventBus, EventReceiver, EventSender, SendError};
pub use event::{
    CacheEvent, EngineEvent, EventCategory, GraphEvent, ProcessEvent, RuleEvent, SessionEvent,
    StoreEvent,
};
pub use layer::CairnEventLayer;
pub use metadata::{correlation_id, set_correlation_id};
pub use renderers::JsonRenderer;

// ============================================================================
// Emit Macros
// ============================================================================

/// Emit a rule started event.
///
/// ```rust,ignore
/// emit_rule_started!("compile", "Binary");
/// ```
#[macro_export]
macro_rules! emit_rule_started {
    ($rule:expr, $product:expr) => {
        ::tracing::debug!(
            target: "cairn::rule",
            event_type = "rule.started",
            rule = %$rule,
            product = %$product,
        )
    };
}

/// Emit a rule completed event.
#[macro_export]
macro_rules! emit_rule_completed {
    ($rule:expr, $success:expr, $duration_ms:expr) => {
        ::tracing::debug!(
            target: "cairn::rule",
            event_type = "rule.completed",
            rule = %$rule,
            success = $success,
            duration_ms = $duration_ms,
        )
    };
}

/// Emit a cache hit event. `$cache` names the cache ("memo", "action").
#[macro_export]
macro_rules! emit_cache_hit {
    ($cache:expr, $key:expr) => {
        ::tracing::debug!(
            target: "cairn::cache",
            event_type = "cache.hit",
            cache = %$cache,
            key = %$key,
        )
    };
}

/// Emit a cache miss event.
#[macro_export]
macro_rules! emit_cache_miss {
    ($cache:expr, $key:expr) => {
        ::tracing::debug!(
            target: "cairn::cache",
            event_type = "cache.miss",
            cache = %$cache,
            key = %$key,
        )
    };
}

/// Emit a process started event.
///
/// ```rust,ignore
/// emit_process_started!("echo hello", vec!["echo".to_string(), "hello".to_string()]);
/// ```
#[macro_export]
macro_rules! emit_process_started {
    ($description:expr, $argv:expr) => {
        ::tracing::info!(
            target: "cairn::process",
            event_type = "process.started",
            description = %$description,
            argv = ?$argv,
        )
    };
}

/// Emit a process completed event.
#[macro_export]
macro_rules! emit_process_completed {
    ($description:expr, $success:expr, $exit_code:expr, $duration_ms:expr) => {
        ::tracing::info!(
            target: "cairn::process",
            event_type = "process.completed",
            description = %$description,
            success = $success,
            exit_code = ?$exit_code,
            duration_ms = $duration_ms,
        )
    };
}

/// Emit a process timeout event.
#[macro_export]
macro_rules! emit_process_timeout {
    ($description:expr, $timeout_ms:expr) => {
        ::tracing::warn!(
            target: "cairn::process",
            event_type = "process.timed_out",
            description = %$description,
            timeout_ms = $timeout_ms,
        )
    };
}

/// Emit a store garbage collection event.
#[macro_export]
macro_rules! emit_store_gc {
    ($blobs_removed:expr, $bytes_freed:expr) => {
        ::tracing::info!(
            target: "cairn::store",
            event_type = "store.gc",
            blobs_removed = $blobs_removed,
            bytes_freed = $bytes_freed,
        )
    };
}

/// Emit a memo graph invalidation event.
#[macro_export]
macro_rules! emit_invalidation {
    ($cleared:expr, $dirtied:expr) => {
        ::tracing::info!(
            target: "cairn::graph",
            event_type = "graph.invalidated",
            cleared = $cleared,
            dirtied = $dirtied,
        )
    };
}

/// Emit a memo graph eviction event.
#[macro_export]
macro_rules! emit_eviction {
    ($count:expr) => {
        ::tracing::info!(
            target: "cairn::graph",
            event_type = "graph.evicted",
            count = $count,
        )
    };
}

/// Emit a session request started event.
#[macro_export]
macro_rules! emit_request_started {
    ($product:expr) => {
        ::tracing::info!(
            target: "cairn::session",
            event_type = "session.request_started",
            product = %$product,
        )
    };
}

/// Emit a session request completed event.
#[macro_export]
macro_rules! emit_request_completed {
    ($product:expr, $success:expr, $duration_ms:expr) => {
        ::tracing::info!(
            target: "cairn::session",
            event_type = "session.request_completed",
            product = %$product,
            success = $success,
            duration_ms = $duration_ms,
        )
    };
}
