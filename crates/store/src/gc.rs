//! Garbage collection policy and victim selection.
//!
//! Both store tiers are collected the same way: when a tier holds more than
//! `max_size_bytes`, least recently used blobs are removed until it fits.
//! Blobs reachable from the policy's retained digests are never removed.

use crate::{Digest, Fingerprint};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// GC policy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcPolicy {
    /// Target size of each tier in bytes
    pub max_size_bytes: u64,
    /// Roots that must survive collection, along with every blob they reference
    #[serde(default)]
    pub retain: Vec<Digest>,
}

impl GcPolicy {
    /// Collect down to `max_size_bytes`, retaining nothing
    #[must_use]
    pub const fn with_max_size(max_size_bytes: u64) -> Self {
        Self {
            max_size_bytes,
            retain: Vec::new(),
        }
    }

    /// Add roots to retain
    #[must_use]
    pub fn retaining(mut self, digests: impl IntoIterator<Item = Digest>) -> Self {
        self.retain.extend(digests);
        self
    }
}

/// Result of a GC operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcResult {
    /// Blobs removed, counted once per tier they were removed from
    pub blobs_removed: usize,
    /// Bytes freed across tiers
    pub bytes_freed: u64,
}

impl GcResult {
    pub(crate) const fn record(&mut self, size: u64) {
        self.blobs_removed += 1;
        self.bytes_freed += size;
    }
}

/// Occupancy of the store tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Blobs held in memory
    pub memory_blobs: usize,
    /// Bytes held in memory
    pub memory_bytes: u64,
    /// Blobs on disk (zero for memory-only stores)
    pub disk_blobs: usize,
    /// Bytes on disk
    pub disk_bytes: u64,
}

/// A blob considered for collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GcCandidate {
    pub fingerprint: Fingerprint,
    pub size: u64,
    /// Larger is more recent; only the ordering matters
    pub last_used: u128,
}

/// Pick the blobs to remove so the remainder fits in `max_size_bytes`.
///
/// Retained blobs still count towards the total but are skipped, so the result
/// may leave the tier over budget when retained content alone exceeds it.
pub(crate) fn select_victims(
    mut candidates: Vec<GcCandidate>,
    max_size_bytes: u64,
    retained: &HashSet<Fingerprint>,
) -> Vec<GcCandidate> {
    let mut total: u64 = candidates.iter().map(|c| c.size).sum();
    if total <= max_size_bytes {
        return Vec::new();
    }

    candidates.sort_by_key(|c| (c.last_used, c.fingerprint));

    let mut victims = Vec::new();
    for candidate in candidates {
        if total <= max_size_bytes {
            break;
        }
        if retained.contains(&candidate.fingerprint) {
            continue;
        }
        total -= candidate.size;
        victims.push(candidate);
    }
    victims
}
