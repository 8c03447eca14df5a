//! The two-tier content-addressed store.

use crate::directory::{
    DirectoryNode, DirectoryTree, EMPTY_DIRECTORY_DIGEST, FileEntry, TreeEntry, path_components,
};
use crate::gc::{GcCandidate, GcPolicy, GcResult, StoreStats, select_victims};
use crate::local::LocalStore;
use crate::{Digest, Error, Fingerprint, Result};
use bytes::Bytes;
use cairn_events::emit_store_gc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// File content supplied to, or returned from, the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    /// Relative path within the tree
    pub path: String,
    /// File bytes
    pub content: Bytes,
    /// Executable bit
    pub is_executable: bool,
}

impl FileContent {
    /// A non-executable file
    #[must_use]
    pub fn new(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            is_executable: false,
        }
    }
}

/// One line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathEntry {
    /// A file and its contents digest
    File {
        /// Relative path
        path: String,
        /// Contents digest
        digest: Digest,
        /// Executable bit
        is_executable: bool,
    },
    /// A directory (listed even when it has content, so empty ones show up)
    Directory {
        /// Relative path
        path: String,
    },
}

impl PathEntry {
    /// The entry's relative path
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::File { path, .. } | Self::Directory { path } => path,
        }
    }
}

#[derive(Debug)]
struct MemoryBlob {
    bytes: Bytes,
    last_used: AtomicU64,
}

/// Default bound on the memory tier of a store with an on-disk tier
pub const DEFAULT_MEMORY_CACHE_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug)]
struct Inner {
    memory: RwLock<HashMap<Fingerprint, MemoryBlob>>,
    memory_bytes: AtomicU64,
    local: Option<LocalStore>,
    memory_limit: u64,
    clock: AtomicU64,
}

/// Content-addressed store of blobs and directory trees.
///
/// Cloning is cheap; clones share the same storage. Every write is "insert if
/// absent", so concurrent writers of the same content are harmless.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// A store that keeps everything in memory
    #[must_use]
    pub fn memory() -> Self {
        Self::build(None, u64::MAX)
    }

    /// A store backed by an on-disk tier rooted at `root`, caching up to
    /// [`DEFAULT_MEMORY_CACHE_BYTES`] in memory
    #[must_use]
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::local_with_memory_limit(root, DEFAULT_MEMORY_CACHE_BYTES)
    }

    /// A store backed by an on-disk tier rooted at `root`, caching up to
    /// `memory_limit` bytes in memory.
    ///
    /// Least recently used blobs leave the memory tier once it exceeds the
    /// limit; they stay on disk.
    #[must_use]
    pub fn local_with_memory_limit(root: impl Into<PathBuf>, memory_limit: u64) -> Self {
        Self::build(Some(LocalStore::new(root)), memory_limit)
    }

    fn build(local: Option<LocalStore>, memory_limit: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                memory: RwLock::new(HashMap::new()),
                memory_bytes: AtomicU64::new(0),
                local,
                memory_limit,
                clock: AtomicU64::new(0),
            }),
        }
    }

    /// Root of the on-disk tier, if any
    #[must_use]
    pub fn local_root(&self) -> Option<&Path> {
        self.inner.local.as_ref().map(LocalStore::root)
    }

    fn tick(&self) -> u64 {
        self.inner.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Store bytes, returning their digest
    ///
    /// # Errors
    ///
    /// Returns error if writing to the on-disk tier fails
    pub fn write(&self, bytes: impl Into<Bytes>) -> Result<Digest> {
        let bytes = bytes.into();
        let digest = Digest::of_bytes(&bytes);

        if let Some(local) = &self.inner.local {
            local.store(digest, &bytes)?;
        }

        self.remember(digest.hash, bytes);
        Ok(digest)
    }

    /// Insert into the memory tier, then shrink it back under its limit.
    fn remember(&self, fingerprint: Fingerprint, bytes: Bytes) {
        let now = self.tick();
        let mut memory = self
            .inner
            .memory
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(blob) = memory.get(&fingerprint) {
            blob.last_used.store(now, Ordering::Relaxed);
            return;
        }
        let size = bytes.len() as u64;
        memory.insert(
            fingerprint,
            MemoryBlob {
                bytes,
                last_used: AtomicU64::new(now),
            },
        );
        let total = self.inner.memory_bytes.fetch_add(size, Ordering::Relaxed) + size;
        if self.inner.local.is_none() || total <= self.inner.memory_limit {
            return;
        }

        // Shrink to three quarters of the limit so eviction is amortized.
        let target = self.inner.memory_limit - self.inner.memory_limit / 4;
        let candidates = memory
            .iter()
            .map(|(fingerprint, blob)| GcCandidate {
                fingerprint: *fingerprint,
                size: blob.bytes.len() as u64,
                last_used: u128::from(blob.last_used.load(Ordering::Relaxed)),
            })
            .collect();
        let mut evicted = 0;
        for victim in select_victims(candidates, target, &HashSet::new()) {
            if memory.remove(&victim.fingerprint).is_some() {
                self.inner.memory_bytes.fetch_sub(victim.size, Ordering::Relaxed);
                evicted += 1;
            }
        }
        tracing::trace!(evicted, "Shrank memory tier");
    }

    /// Load the bytes for a digest
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no tier holds the digest, or `Integrity` if the
    /// stored content does not match it
    pub fn read(&self, digest: Digest) -> Result<Bytes> {
        if digest == crate::EMPTY_DIGEST {
            return Ok(Bytes::new());
        }

        let cached = {
            let memory = self
                .inner
                .memory
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            memory.get(&digest.hash).map(|blob| {
                blob.last_used.store(self.tick(), Ordering::Relaxed);
                blob.bytes.clone()
            })
        };
        if let Some(bytes) = cached {
            if bytes.len() != digest.size_bytes {
                return Err(Error::Integrity {
                    expected: digest,
                    actual: Digest::of_bytes(&bytes),
                });
            }
            return Ok(bytes);
        }

        let Some(local) = &self.inner.local else {
            return Err(Error::not_found(digest));
        };
        let Some(data) = local.load(digest)? else {
            return Err(Error::not_found(digest));
        };
        if let Err(e) = local.touch(&digest.hash) {
            tracing::debug!(error = %e, %digest, "Failed to refresh blob access time");
        }

        let bytes = Bytes::from(data);
        self.remember(digest.hash, bytes.clone());
        Ok(bytes)
    }

    /// Whether any tier holds the digest
    #[must_use]
    pub fn contains(&self, digest: Digest) -> bool {
        if digest == crate::EMPTY_DIGEST {
            return true;
        }
        let in_memory = self
            .inner
            .memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&digest.hash)
            .is_some_and(|blob| blob.bytes.len() == digest.size_bytes);
        in_memory
            || self
                .inner
                .local
                .as_ref()
                .is_some_and(|local| local.exists(&digest.hash))
    }

    /// Persist every node of a directory tree, returning the root digest
    ///
    /// # Errors
    ///
    /// Returns error if a node cannot be encoded or written
    pub fn record_directory(&self, tree: &DirectoryTree) -> Result<Digest> {
        let mut nodes = Vec::new();
        tree.walk_trees(&mut |t| nodes.push(t));
        for node in nodes {
            self.write(node.node().encode()?)?;
        }
        Ok(tree.digest())
    }

    /// Load a directory tree by its root digest
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if any node is missing, or a serialization error if
    /// a blob is not a directory node
    pub fn load_directory(&self, digest: Digest) -> Result<DirectoryTree> {
        if digest == *EMPTY_DIRECTORY_DIGEST {
            return Ok(DirectoryTree::empty());
        }
        let node = DirectoryNode::decode(&self.read(digest)?)?;

        let mut entries = BTreeMap::new();
        for file in node.files {
            entries.insert(
                file.name,
                TreeEntry::File(FileEntry {
                    digest: file.digest,
                    is_executable: file.is_executable,
                }),
            );
        }
        for child in node.directories {
            let tree = self.load_directory(child.digest)?;
            entries.insert(child.name, TreeEntry::Directory(tree));
        }

        let tree = DirectoryTree::from_entries(entries)?;
        if tree.digest() != digest {
            return Err(Error::Integrity {
                expected: digest,
                actual: tree.digest(),
            });
        }
        Ok(tree)
    }

    /// Build and store a directory from file contents
    ///
    /// # Errors
    ///
    /// Returns a conflict or invalid path error for inconsistent paths, or an
    /// I/O error from the on-disk tier
    pub fn snapshot(&self, files: Vec<FileContent>) -> Result<Digest> {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let digest = self.write(file.content)?;
            entries.push((
                file.path,
                FileEntry {
                    digest,
                    is_executable: file.is_executable,
                },
            ));
        }
        let tree = DirectoryTree::from_files(entries)?;
        self.record_directory(&tree)
    }

    /// Ingest a directory from the filesystem
    ///
    /// Symlinks are skipped. Empty directories are kept.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    pub fn snapshot_path(&self, root: &Path) -> Result<Digest> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                Error::io(source, path, "read_dir")
            })?;
            let relative = relative_path(root, entry.path())?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                paths.push((relative, None));
            } else if file_type.is_file() {
                let data = fs::read(entry.path()).map_err(|e| Error::io(e, entry.path(), "read"))?;
                let digest = self.write(data)?;
                let is_executable = is_executable(entry.path())?;
                paths.push((
                    relative,
                    Some(FileEntry {
                        digest,
                        is_executable,
                    }),
                ));
            } else {
                tracing::debug!(path = %entry.path().display(), "Skipping non-regular file");
            }
        }
        let tree = DirectoryTree::from_paths(paths)?;
        self.record_directory(&tree)
    }

    /// Ingest selected files and directories below `root`
    ///
    /// Listed directories are recorded without content apart from listed
    /// paths beneath them.
    ///
    /// # Errors
    ///
    /// Returns an invalid path error for absolute or escaping paths, or an I/O
    /// error if a file cannot be read
    pub fn snapshot_paths<S: AsRef<str>>(
        &self,
        root: &Path,
        files: &[S],
        dirs: &[S],
    ) -> Result<Digest> {
        let mut paths = Vec::with_capacity(files.len() + dirs.len());
        for dir in dirs {
            path_components(dir.as_ref())?;
            paths.push((dir.as_ref().to_string(), None));
        }
        for file in files {
            let path = root.join(path_components(file.as_ref())?.join("/"));
            let data = fs::read(&path).map_err(|e| Error::io(e, &path, "read"))?;
            let digest = self.write(data)?;
            paths.push((
                file.as_ref().to_string(),
                Some(FileEntry {
                    digest,
                    is_executable: is_executable(&path)?,
                }),
            ));
        }
        let tree = DirectoryTree::from_paths(paths)?;
        self.record_directory(&tree)
    }

    /// All files in a directory with their contents, sorted by path
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the tree or any file is missing
    pub fn contents(&self, digest: Digest) -> Result<Vec<FileContent>> {
        let tree = self.load_directory(digest)?;
        tree.files()
            .into_iter()
            .map(|(path, file)| {
                Ok(FileContent {
                    path,
                    content: self.read(file.digest)?,
                    is_executable: file.is_executable,
                })
            })
            .collect()
    }

    /// Every file and directory in a tree, sorted by path
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the tree is missing
    pub fn entries(&self, digest: Digest) -> Result<Vec<PathEntry>> {
        let tree = self.load_directory(digest)?;
        let mut entries: Vec<PathEntry> = tree
            .directories()
            .into_iter()
            .map(|path| PathEntry::Directory { path })
            .chain(tree.files().into_iter().map(|(path, file)| PathEntry::File {
                path,
                digest: file.digest,
                is_executable: file.is_executable,
            }))
            .collect();
        entries.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(entries)
    }

    /// Merge directories into their union
    ///
    /// # Errors
    ///
    /// Returns `Conflict` naming the path when inputs disagree, or `NotFound`
    /// if an input is missing
    pub fn merge(&self, digests: &[Digest]) -> Result<Digest> {
        let trees = digests
            .iter()
            .map(|d| self.load_directory(*d))
            .collect::<Result<Vec<_>>>()?;
        let merged = DirectoryTree::merge(trees)?;
        self.record_directory(&merged)
    }

    /// Nest a directory under `prefix`
    ///
    /// # Errors
    ///
    /// Returns error if the tree is missing or the prefix is invalid
    pub fn add_prefix(&self, digest: Digest, prefix: &str) -> Result<Digest> {
        let tree = self.load_directory(digest)?.add_prefix(prefix)?;
        self.record_directory(&tree)
    }

    /// Strip `prefix` from a directory
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` if any entry lies outside the prefix
    pub fn remove_prefix(&self, digest: Digest, prefix: &str) -> Result<Digest> {
        let tree = self.load_directory(digest)?.remove_prefix(prefix)?;
        self.record_directory(&tree)
    }

    /// Keep only the given paths of a directory
    ///
    /// # Errors
    ///
    /// Returns error if the tree is missing or a path is invalid
    pub fn subset<S: AsRef<str>>(&self, digest: Digest, paths: &[S]) -> Result<Digest> {
        let tree = self.load_directory(digest)?.subset(paths)?;
        self.record_directory(&tree)
    }

    /// Write a directory tree to `destination`, creating it if needed
    ///
    /// Existing files at the same paths are overwritten.
    ///
    /// # Errors
    ///
    /// Returns error if content is missing or the filesystem write fails
    pub fn materialize(&self, digest: Digest, destination: &Path) -> Result<()> {
        let tree = self.load_directory(digest)?;
        fs::create_dir_all(destination).map_err(|e| Error::io(e, destination, "create_dir_all"))?;
        for dir in tree.directories() {
            let path = destination.join(&dir);
            fs::create_dir_all(&path).map_err(|e| Error::io(e, &path, "create_dir_all"))?;
        }
        for (relative, file) in tree.files() {
            let path = destination.join(&relative);
            let content = self.read(file.digest)?;
            fs::write(&path, &content).map_err(|e| Error::io(e, &path, "write"))?;
            if file.is_executable {
                set_executable(&path)?;
            }
        }
        Ok(())
    }

    /// Current occupancy of both tiers
    ///
    /// # Errors
    ///
    /// Returns error if the on-disk tier cannot be listed
    pub fn stats(&self) -> Result<StoreStats> {
        let (memory_blobs, memory_bytes) = {
            let memory = self
                .inner
                .memory
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            (
                memory.len(),
                memory.values().map(|b| b.bytes.len() as u64).sum::<u64>(),
            )
        };
        let (disk_blobs, disk_bytes) = match &self.inner.local {
            Some(local) => {
                let blobs = local.list()?;
                (blobs.len(), blobs.iter().map(|b| b.size).sum::<u64>())
            }
            None => (0, 0),
        };
        Ok(StoreStats {
            memory_blobs,
            memory_bytes,
            disk_blobs,
            disk_bytes,
        })
    }

    /// Shrink each tier to the policy's size bound
    ///
    /// # Errors
    ///
    /// Returns error if the on-disk tier cannot be listed or a blob cannot be deleted
    pub fn gc(&self, policy: &GcPolicy) -> Result<GcResult> {
        let retained = self.reachable(&policy.retain);
        let mut result = GcResult::default();

        {
            let mut memory = self
                .inner
                .memory
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let candidates = memory
                .iter()
                .map(|(fingerprint, blob)| GcCandidate {
                    fingerprint: *fingerprint,
                    size: blob.bytes.len() as u64,
                    last_used: u128::from(blob.last_used.load(Ordering::Relaxed)),
                })
                .collect();
            for victim in select_victims(candidates, policy.max_size_bytes, &retained) {
                if memory.remove(&victim.fingerprint).is_some() {
                    self.inner
                        .memory_bytes
                        .fetch_sub(victim.size, Ordering::Relaxed);
                    result.record(victim.size);
                }
            }
        }

        if let Some(local) = &self.inner.local {
            let candidates = local
                .list()?
                .into_iter()
                .map(|blob| GcCandidate {
                    fingerprint: blob.fingerprint,
                    size: blob.size,
                    last_used: blob
                        .modified
                        .duration_since(UNIX_EPOCH)
                        .map_or(0, |d| d.as_nanos()),
                })
                .collect();
            for victim in select_victims(candidates, policy.max_size_bytes, &retained) {
                let freed = local.delete(&victim.fingerprint)?;
                if freed > 0 {
                    result.record(freed);
                }
            }
        }

        emit_store_gc!(result.blobs_removed, result.bytes_freed);
        Ok(result)
    }

    /// Fingerprints of the given digests plus everything their trees reference
    fn reachable(&self, roots: &[Digest]) -> HashSet<Fingerprint> {
        let mut reachable = HashSet::new();
        let mut pending: Vec<Digest> = roots.to_vec();
        while let Some(digest) = pending.pop() {
            if !reachable.insert(digest.hash) {
                continue;
            }
            let Ok(bytes) = self.read(digest) else {
                continue;
            };
            // Blobs that are not directory nodes are leaves
            if let Ok(node) = DirectoryNode::decode(&bytes) {
                pending.extend(node.files.iter().map(|f| f.digest));
                pending.extend(node.directories.iter().map(|d| d.digest));
            }
        }
        reachable
    }
}

fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| Error::invalid_path(path.display().to_string(), "outside of snapshot root"))?;
    let mut parts = Vec::new();
    for component in relative.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            Error::invalid_path(path.display().to_string(), "path is not valid UTF-8")
        })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path).map_err(|e| Error::io(e, path, "metadata"))?;
    Ok(meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> Result<bool> {
    Ok(false)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::io(e, path, "set_permissions"))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
