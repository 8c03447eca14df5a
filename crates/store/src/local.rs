//! On-disk blob tier.
//!
//! Blobs are stored by their SHA-256 fingerprint in a two-level directory
//! structure to avoid filesystem limitations with large numbers of files in a
//! single directory.
//!
//! ```text
//! {root}/
//!   ab/
//!     cd/
//!       abcdef123456... (blob bytes)
//! ```
//!
//! Writes go through a temporary file in the target directory followed by an
//! atomic rename, so concurrent writers of the same blob never observe a
//! partially written file. Reads verify the content against the fingerprint.

use crate::{Digest, Error, Fingerprint, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Metadata about a blob on disk, used by garbage collection.
#[derive(Debug, Clone)]
pub struct DiskBlob {
    /// Fingerprint parsed from the file name
    pub fingerprint: Fingerprint,
    /// Size of the blob in bytes
    pub size: u64,
    /// Last modification time (writes refresh it)
    pub modified: SystemTime,
}

/// Content-addressable on-disk storage backend
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a local store rooted at the given directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for a blob: `{root}/{hex[0:2]}/{hex[2:4]}/{hex}`
    pub(crate) fn blob_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    /// Store a blob that has already been hashed
    ///
    /// # Errors
    ///
    /// Returns error if IO operations fail
    pub fn store(&self, digest: Digest, data: &[u8]) -> Result<()> {
        let path = self.blob_path(&digest.hash);

        if path.exists() {
            return Ok(());
        }

        let parent = path
            .parent()
            .ok_or_else(|| Error::invalid_path(path.display().to_string(), "blob has no parent"))?;
        fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::io(e, parent, "create temp file"))?;
        tmp.write_all(data)
            .map_err(|e| Error::io(e, tmp.path(), "write"))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io(e, tmp.path(), "sync"))?;

        // A concurrent writer may have won the race; identical content either way.
        if let Err(e) = tmp.persist(&path) {
            if !path.exists() {
                return Err(Error::io(e.error, &path, "rename"));
            }
        }

        Ok(())
    }

    /// Load a blob, verifying its integrity
    ///
    /// Returns `Ok(None)` if the blob is not present.
    ///
    /// # Errors
    ///
    /// Returns error if the content does not match the digest or IO fails
    pub fn load(&self, digest: Digest) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(&digest.hash);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &path, "read")),
        };

        let actual = Digest::of_bytes(&data);
        if actual != digest {
            return Err(Error::Integrity {
                expected: digest,
                actual,
            });
        }

        Ok(Some(data))
    }

    /// Check if a blob exists
    #[must_use]
    pub fn exists(&self, fingerprint: &Fingerprint) -> bool {
        self.blob_path(fingerprint).exists()
    }

    /// Refresh a blob's modification time so garbage collection sees it as recently used
    ///
    /// # Errors
    ///
    /// Returns error if the blob cannot be opened
    pub fn touch(&self, fingerprint: &Fingerprint) -> Result<()> {
        let path = self.blob_path(fingerprint);
        let file = fs::File::options()
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(e, &path, "open"))?;
        file.set_modified(SystemTime::now())
            .map_err(|e| Error::io(e, &path, "set_modified"))
    }

    /// Delete a blob, returning the number of bytes freed
    ///
    /// # Errors
    ///
    /// Returns error if IO operations fail
    pub fn delete(&self, fingerprint: &Fingerprint) -> Result<u64> {
        let path = self.blob_path(fingerprint);
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io(e, &path, "metadata")),
        };
        fs::remove_file(&path).map_err(|e| Error::io(e, &path, "remove_file"))?;
        Ok(size)
    }

    /// List all blobs in the store
    ///
    /// Files whose names are not fingerprints (e.g. abandoned temp files) are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if directory traversal fails
    pub fn list(&self) -> Result<Vec<DiskBlob>> {
        let mut blobs = Vec::new();

        if !self.root.exists() {
            return Ok(blobs);
        }

        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf);
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                match path {
                    Some(p) => Error::io(source, p, "read_dir"),
                    None => Error::io_no_path(source, "read_dir"),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Ok(fingerprint) = Fingerprint::from_hex(name) else {
                continue;
            };
            let meta = entry
                .metadata()
                .map_err(|e| Error::io(std::io::Error::other(e), entry.path(), "metadata"))?;
            blobs.push(DiskBlob {
                fingerprint,
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        Ok(blobs)
    }

    /// Total size of all blobs in the store
    ///
    /// # Errors
    ///
    /// Returns error if directory traversal fails
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list()?.iter().map(|b| b.size).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_load() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let data = b"test data";
        let digest = Digest::of_bytes(data);
        store.store(digest, data).unwrap();

        assert!(store.exists(&digest.hash));
        assert_eq!(store.load(digest).unwrap().unwrap(), data);
    }

    #[test]
    fn test_store_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let data = b"test data";
        let digest = Digest::of_bytes(data);
        store.store(digest, data).unwrap();
        store.store(digest, data).unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_load_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        assert!(store.load(Digest::of_bytes(b"absent")).unwrap().is_none());
    }

    #[test]
    fn test_integrity_check() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let data = b"test data";
        let digest = Digest::of_bytes(data);
        store.store(digest, data).unwrap();

        fs::write(store.blob_path(&digest.hash), b"corrupted").unwrap();

        assert!(matches!(
            store.load(digest),
            Err(Error::Integrity { .. })
        ));
    }

    #[test]
    fn test_delete() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let data = b"test data";
        let digest = Digest::of_bytes(data);
        store.store(digest, data).unwrap();

        assert_eq!(store.delete(&digest.hash).unwrap(), data.len() as u64);
        assert!(!store.exists(&digest.hash));
        assert_eq!(store.delete(&digest.hash).unwrap(), 0);
    }

    #[test]
    fn test_list_and_total_size() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        for data in [&b"data1"[..], b"data22", b"data333"] {
            store.store(Digest::of_bytes(data), data).unwrap();
        }

        assert_eq!(store.list().unwrap().len(), 3);
        assert_eq!(store.total_size().unwrap(), 5 + 6 + 7);
    }

    #[test]
    fn test_two_level_directory_structure() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let digest = Digest::of_bytes(b"test");
        let path = store.blob_path(&digest.hash);
        let hex = digest.hash.to_hex();

        let rel = path.strip_prefix(tmp.path()).unwrap();
        let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy().to_string()).collect();
        assert_eq!(parts, vec![hex[0..2].to_string(), hex[2..4].to_string(), hex]);
    }
}
