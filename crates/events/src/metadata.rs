//! Correlation id tracking for engine events.

use std::sync::OnceLock;
use uuid::Uuid;

/// Global correlation ID for the current process.
static CORRELATION_ID: OnceLock<Uuid> = OnceLock::new();

/// Get or create the correlation ID for the current process.
///
/// This returns the same ID throughout the lifetime of the process,
/// allowing all events to be correlated together.
#[must_use]
pub fn correlation_id() -> Uuid {
    *CORRELATION_ID.get_or_init(Uuid::new_v4)
}

/// Set the correlation ID for the current process.
///
/// Only the first call wins. Returns `true` if the ID was set.
pub fn set_correlation_id(id: Uuid) -> bool {
    CORRELATION_ID.set(id).is_ok()
}
