//! Tracing layer that captures engine events.
//!
//! The layer intercepts tracing events whose target starts with `cairn` and that
//! carry an `event_type` field, converts them to [`EngineEvent`]s and forwards
//! them to an [`crate::EventBus`].

// Field values come from the emit macros in this crate
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use crate::event::{
    CacheEvent, EngineEvent, EventCategory, GraphEvent, ProcessEvent, RuleEvent, SessionEvent,
    StoreEvent,
};
use crate::metadata::correlation_id;
use tokio::sync::mpsc;
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

/// A tracing layer that captures cairn engine events.
pub struct CairnEventLayer {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl CairnEventLayer {
    /// Create a new layer that sends events to the given channel.
    #[must_use]
    pub const fn new(sender: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { sender }
    }
}

impl<S> Layer<S> for CairnEventLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let target = event.metadata().target();
        if !target.starts_with("cairn") {
            return;
        }

        let mut visitor = EventVisitor::new(target);
        event.record(&mut visitor);

        if let Some(engine_event) = visitor.build() {
            let _ = self.sender.send(engine_event);
        }
    }
}

/// Collects the typed fields of a single tracing event.
#[derive(Default)]
struct EventVisitor {
    target: String,
    event_type: Option<String>,

    rule: Option<String>,
    product: Option<String>,
    cache: Option<String>,
    key: Option<String>,
    description: Option<String>,
    argv: Option<Vec<String>>,

    success: Option<bool>,
    exit_code: Option<i32>,
    duration_ms: Option<u64>,
    timeout_ms: Option<u64>,

    blobs_removed: Option<usize>,
    bytes_freed: Option<u64>,
    cleared: Option<usize>,
    dirtied: Option<usize>,
    count: Option<usize>,
}

impl EventVisitor {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            ..Self::default()
        }
    }

    fn build(self) -> Option<EngineEvent> {
        let event_type = self.event_type.as_deref()?;

        let category = match event_type {
            "rule.started" => EventCategory::Rule(RuleEvent::Started {
                rule: self.rule?,
                product: self.product?,
            }),
            "rule.completed" => EventCategory::Rule(RuleEvent::Completed {
                rule: self.rule?,
                success: self.success?,
                duration_ms: self.duration_ms.unwrap_or(0),
            }),

            "cache.hit" => EventCategory::Cache(CacheEvent::Hit {
                cache: self.cache?,
                key: self.key?,
            }),
            "cache.miss" => EventCategory::Cache(CacheEvent::Miss {
                cache: self.cache?,
                key: self.key?,
            }),

            "process.started" => EventCategory::Process(ProcessEvent::Started {
                description: self.description?,
                argv: self.argv.unwrap_or_default(),
            }),
            "process.completed" => EventCategory::Process(ProcessEvent::Completed {
                description: self.description?,
                success: self.success?,
                exit_code: self.exit_code,
                duration_ms: self.duration_ms.unwrap_or(0),
            }),
            "process.timed_out" => EventCategory::Process(ProcessEvent::TimedOut {
                description: self.description?,
                timeout_ms: self.timeout_ms?,
            }),

            "store.gc" => EventCategory::Store(StoreEvent::GarbageCollected {
                blobs_removed: self.blobs_removed?,
                bytes_freed: self.bytes_freed?,
            }),

            "graph.invalidated" => EventCategory::Graph(GraphEvent::Invalidated {
                cleared: self.cleared?,
                dirtied: self.dirtied?,
            }),
            "graph.evicted" => EventCategory::Graph(GraphEvent::Evicted { count: self.count? }),

            "session.request_started" => EventCategory::Session(SessionEvent::RequestStarted {
                product: self.product?,
            }),
            "session.request_completed" => {
                EventCategory::Session(SessionEvent::RequestCompleted {
                    product: self.product?,
                    success: self.success?,
                    duration_ms: self.duration_ms.unwrap_or(0),
                })
            }

            _ => return None,
        };

        Some(EngineEvent::new(correlation_id(), self.target, category))
    }

    fn record_string(&mut self, name: &str, value: String) {
        match name {
            "event_type" => self.event_type = Some(value),
            "rule" => self.rule = Some(value),
            "product" => self.product = Some(value),
            "cache" => self.cache = Some(value),
            "key" => self.key = Some(value),
            "description" => self.description = Some(value),
            _ => {}
        }
    }

    fn record_unsigned(&mut self, name: &str, value: u64) {
        match name {
            "duration_ms" => self.duration_ms = Some(value),
            "timeout_ms" => self.timeout_ms = Some(value),
            "bytes_freed" => self.bytes_freed = Some(value),
            "blobs_removed" => self.blobs_removed = Some(value as usize),
            "cleared" => self.cleared = Some(value as usize),
            "dirtied" => self.dirtied = Some(value as usize),
            "count" => self.count = Some(value as usize),
            _ => {}
        }
    }
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_string(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "exit_code" {
            self.exit_code = Some(value as i32);
        } else if let Ok(value) = u64::try_from(value) {
            self.record_unsigned(field.name(), value);
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "exit_code" {
            self.exit_code = i32::try_from(value).ok();
        } else {
            self.record_unsigned(field.name(), value);
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "success" {
            self.success = Some(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // `%value` fields arrive here rendered through Display
        let rendered = format!("{value:?}");
        match field.name() {
            "argv" => {
                if let Ok(argv) = serde_json::from_str::<Vec<String>>(&rendered) {
                    self.argv = Some(argv);
                }
            }
            "exit_code" => {
                // Option<i32> recorded with `?`
                self.exit_code = rendered
                    .strip_prefix("Some(")
                    .and_then(|s| s.strip_suffix(')'))
                    .and_then(|s| s.parse().ok());
            }
            name => self.record_string(name, rendered),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(f: impl FnOnce()) -> Vec<EngineEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(CairnEventLayer::new(tx));
        tracing::subscriber::with_default(subscriber, f);
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_layer_captures_rule_events() {
        let events = capture(|| {
            tracing::info!(
                target: "cairn::rule",
                event_type = "rule.started",
                rule = "compile",
                product = "Binary",
            );
        });

        assert_eq!(events.len(), 1);
        match &events[0].category {
            EventCategory::Rule(RuleEvent::Started { rule, product }) => {
                assert_eq!(rule, "compile");
                assert_eq!(product, "Binary");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_layer_ignores_foreign_targets() {
        let events = capture(|| {
            tracing::info!(
                target: "other::target",
                event_type = "rule.started",
                rule = "ignored",
                product = "Nothing",
            );
        });
        assert!(events.is_empty());
    }

    #[test]
    fn test_layer_skips_incomplete_events() {
        let events = capture(|| {
            tracing::info!(target: "cairn::rule", event_type = "rule.started", rule = "x");
            tracing::info!(target: "cairn::rule", "plain log line");
        });
        assert!(events.is_empty());
    }

    #[test]
    fn test_display_fields_are_captured() {
        let description = String::from("echo hello");
        let events = capture(|| {
            tracing::info!(
                target: "cairn::process",
                event_type = "process.completed",
                description = %description,
                success = true,
                exit_code = ?Some(0),
                duration_ms = 5_u64,
            );
        });

        match &events[0].category {
            EventCategory::Process(ProcessEvent::Completed {
                description,
                exit_code,
                ..
            }) => {
                assert_eq!(description, "echo hello");
                assert_eq!(*exit_code, Some(0));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
