//! Action cache: maps a request fingerprint to the digest of its result.
//!
//! The engine records successful process results here so that a later
//! session (or a later process) can reuse them without re-running the
//! command. Entries live in memory and, optionally, as small JSON records
//! under `{root}/{hex[0:2]}/{hex}.json`.

use crate::{Digest, Error, Fingerprint, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// A cached result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEntry {
    /// Digest of the serialized result in the store
    pub digest: Digest,
    /// When the entry was recorded
    pub created_at: DateTime<Utc>,
    /// Description of the action, for humans reading the cache
    pub description: String,
}

impl ActionEntry {
    /// A new entry timestamped now
    #[must_use]
    pub fn new(digest: Digest, description: impl Into<String>) -> Self {
        Self {
            digest,
            created_at: Utc::now(),
            description: description.into(),
        }
    }
}

/// In-memory action cache with an optional on-disk tier.
#[derive(Debug, Default)]
pub struct ActionCache {
    memory: RwLock<HashMap<Fingerprint, ActionEntry>>,
    root: Option<PathBuf>,
}

impl ActionCache {
    /// A cache that forgets everything when dropped
    #[must_use]
    pub fn memory() -> Self {
        Self::default()
    }

    /// A cache persisted under `root`
    #[must_use]
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            memory: RwLock::default(),
            root: Some(root.into()),
        }
    }

    fn entry_path(root: &Path, key: &Fingerprint) -> PathBuf {
        let hex = key.to_hex();
        root.join(&hex[0..2]).join(format!("{hex}.json"))
    }

    /// Look up an entry
    ///
    /// Unreadable on-disk records are treated as misses.
    #[must_use]
    pub fn get(&self, key: &Fingerprint) -> Option<ActionEntry> {
        if let Some(entry) = self
            .memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Some(entry.clone());
        }

        let root = self.root.as_ref()?;
        let path = Self::entry_path(root, key);
        let content = fs::read(&path).ok()?;
        let entry: ActionEntry = match serde_json::from_slice(&content) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt action cache entry");
                return None;
            }
        };
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*key, entry.clone());
        Some(entry)
    }

    /// Record an entry, replacing any previous one
    ///
    /// # Errors
    ///
    /// Returns error if the on-disk record cannot be written
    pub fn put(&self, key: Fingerprint, entry: ActionEntry) -> Result<()> {
        if let Some(root) = &self.root {
            let path = Self::entry_path(root, &key);
            let parent = path
                .parent()
                .ok_or_else(|| Error::invalid_path(path.display().to_string(), "no parent"))?;
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;

            let json = serde_json::to_vec_pretty(&entry)
                .map_err(|e| Error::serialization(format!("Failed to encode action entry: {e}")))?;
            let mut tmp = tempfile::NamedTempFile::new_in(parent)
                .map_err(|e| Error::io(e, parent, "create temp file"))?;
            tmp.write_all(&json)
                .map_err(|e| Error::io(e, tmp.path(), "write"))?;
            tmp.persist(&path)
                .map_err(|e| Error::io(e.error, &path, "rename"))?;
        }

        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
        Ok(())
    }

    /// Forget an entry in both tiers
    ///
    /// # Errors
    ///
    /// Returns error if the on-disk record exists but cannot be removed
    pub fn remove(&self, key: &Fingerprint) -> Result<()> {
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if let Some(root) = &self.root {
            let path = Self::entry_path(root, key);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(e, &path, "remove_file")),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_put_get() {
        let cache = ActionCache::memory();
        let key = Fingerprint::from_data(b"request");
        assert!(cache.get(&key).is_none());

        let entry = ActionEntry::new(Digest::of_bytes(b"result"), "echo hi");
        cache.put(key, entry.clone()).unwrap();
        assert_eq!(cache.get(&key), Some(entry));
    }

    #[test]
    fn test_local_entries_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let key = Fingerprint::from_data(b"request");
        let entry = ActionEntry::new(Digest::of_bytes(b"result"), "echo hi");
        ActionCache::local(tmp.path()).put(key, entry.clone()).unwrap();

        let reopened = ActionCache::local(tmp.path());
        assert_eq!(reopened.get(&key), Some(entry));

        let hex = key.to_hex();
        assert!(tmp.path().join(&hex[0..2]).join(format!("{hex}.json")).exists());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let key = Fingerprint::from_data(b"request");
        let hex = key.to_hex();
        let path = tmp.path().join(&hex[0..2]).join(format!("{hex}.json"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json").unwrap();

        assert!(ActionCache::local(tmp.path()).get(&key).is_none());
    }

    #[test]
    fn test_remove() {
        let tmp = TempDir::new().unwrap();
        let cache = ActionCache::local(tmp.path());
        let key = Fingerprint::from_data(b"request");
        cache
            .put(key, ActionEntry::new(Digest::of_bytes(b"r"), "x"))
            .unwrap();
        cache.remove(&key).unwrap();
        assert!(cache.get(&key).is_none());
        cache.remove(&key).unwrap();
    }
}
