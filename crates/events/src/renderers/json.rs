//! JSON renderer for engine events.
//!
//! Renders events as JSON lines for machine consumption.

use crate::bus::EventReceiver;
use crate::event::EngineEvent;
use std::io::Write;

/// JSON renderer that writes one event per line.
#[derive(Debug, Default)]
pub struct JsonRenderer {
    pretty: bool,
}

impl JsonRenderer {
    /// Create a new JSON renderer with compact output.
    #[must_use]
    pub const fn new() -> Self {
        Self { pretty: false }
    }

    /// Create a new JSON renderer with pretty-printed output.
    #[must_use]
    pub const fn pretty() -> Self {
        Self { pretty: true }
    }

    /// Consume events from the receiver, writing them to stderr so that
    /// command output on stdout stays machine readable.
    pub async fn run(self, mut receiver: EventReceiver) {
        while let Some(event) = receiver.recv().await {
            let mut stderr = std::io::stderr().lock();
            let _ = self.render(&event, &mut stderr);
        }
    }

    /// Render a single event followed by a newline.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn render(&self, event: &EngineEvent, out: &mut impl Write) -> std::io::Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(event)
        } else {
            serde_json::to_string(event)
        }
        .map_err(std::io::Error::other)?;
        writeln!(out, "{json}")
    }
}
