//! Multi-subscriber event bus.
//!
//! Events submitted through an [`EventSender`] are forwarded by a background
//! task into a broadcast channel, so any number of receivers see every event.

use crate::event::EngineEvent;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};

/// Default channel capacity for the broadcast channel.
const DEFAULT_BROADCAST_CAPACITY: usize = 1000;

/// Multi-subscriber event bus.
#[derive(Debug)]
pub struct EventBus {
    /// Dropped on `shutdown()`, which ends the forwarding task.
    sender: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    broadcast_tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// Must be called from within a tokio runtime: a forwarding task is spawned.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Create a new event bus with a specific broadcast capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<EngineEvent>();
        let (broadcast_tx, _) = broadcast::channel(capacity);

        let forward = broadcast_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                // No subscribers is not an error
                let _ = forward.send(event);
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            broadcast_tx,
        }
    }

    /// Get a sender for submitting events to the bus.
    ///
    /// Returns `None` if the bus has been shut down.
    #[must_use]
    pub fn sender(&self) -> Option<EventSender> {
        self.sender
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| EventSender { inner: s.clone() }))
    }

    /// Shut down the event bus. Safe to call multiple times.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            let _ = guard.take();
        }
    }

    /// Subscribe to events sent after this call.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            inner: self.broadcast_tx.subscribe(),
        }
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Sender handle for submitting events to an [`EventBus`].
#[derive(Debug, Clone)]
pub struct EventSender {
    inner: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSender {
    /// The raw channel, for use with [`crate::CairnEventLayer`].
    #[must_use]
    pub fn into_inner(self) -> mpsc::UnboundedSender<EngineEvent> {
        self.inner
    }

    /// Send an event to the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus has been dropped.
    pub fn send(&self, event: EngineEvent) -> Result<(), SendError> {
        self.inner.send(event).map_err(|_| SendError::Closed)
    }

    /// Check if the bus is still open.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Receiver handle for events from an [`EventBus`].
#[derive(Debug)]
pub struct EventReceiver {
    inner: broadcast::Receiver<EngineEvent>,
}

impl EventReceiver {
    /// Receive the next event, or `None` once the bus is closed.
    ///
    /// Events are skipped (with a warning) if the receiver falls behind.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.inner.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event receiver lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive an event without waiting.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.inner.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event receiver lagged, skipped events");
                }
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => {
                    return None;
                }
            }
        }
    }
}

/// Error returned when sending to a closed bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The event bus has been closed.
    #[error("event bus is closed")]
    Closed,
}
