//! Directory trees.
//!
//! A [`DirectoryTree`] is an immutable, sorted tree of named entries. Every
//! directory level is serialized canonically as a [`DirectoryNode`] that
//! refers to its children by digest, so a tree is a Merkle tree: the root
//! digest identifies the whole tree and equal trees always share a digest.

use crate::{Digest, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Canonical serialization of a directory with no entries.
const EMPTY_DIRECTORY_NODE: &[u8] = br#"{"files":[],"directories":[]}"#;

/// Digest of the empty directory.
pub static EMPTY_DIRECTORY_DIGEST: LazyLock<Digest> =
    LazyLock::new(|| Digest::of_bytes(EMPTY_DIRECTORY_NODE));

/// A file within a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    /// Digest of the file contents
    pub digest: Digest,
    /// Whether the file carries the executable bit
    pub is_executable: bool,
}

impl FileEntry {
    /// A non-executable file with the given contents digest
    #[must_use]
    pub const fn new(digest: Digest) -> Self {
        Self {
            digest,
            is_executable: false,
        }
    }
}

/// An entry in a [`DirectoryTree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEntry {
    /// A regular file
    File(FileEntry),
    /// A nested directory
    Directory(DirectoryTree),
}

/// Serialized form of a single directory level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    /// Files, sorted by name
    pub files: Vec<FileNode>,
    /// Child directories, sorted by name
    pub directories: Vec<ChildNode>,
}

/// A file reference within a [`DirectoryNode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// File name
    pub name: String,
    /// Digest of the contents
    pub digest: Digest,
    /// Executable bit
    pub is_executable: bool,
}

/// A child directory reference within a [`DirectoryNode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildNode {
    /// Directory name
    pub name: String,
    /// Digest of the child's [`DirectoryNode`]
    pub digest: Digest,
}

impl DirectoryNode {
    /// Canonical bytes of this node
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::serialization(format!("Failed to encode directory node: {e}")))
    }

    /// Parse a node from its canonical bytes
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the bytes are not a directory node
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::serialization(format!("Not a directory node: {e}")))
    }
}

/// Split a relative path into components.
///
/// `.` components and repeated or trailing slashes are ignored. Absolute paths
/// and `..` components are rejected.
///
/// # Errors
///
/// Returns an invalid path error for absolute or escaping paths
pub fn path_components(path: &str) -> Result<Vec<&str>> {
    if path.starts_with('/') {
        return Err(Error::invalid_path(path, "path must be relative"));
    }
    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => return Err(Error::invalid_path(path, "path must not contain '..'")),
            name => components.push(name),
        }
    }
    Ok(components)
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Mutable tree used while assembling a [`DirectoryTree`].
#[derive(Debug, Default)]
struct Builder {
    entries: BTreeMap<String, BuilderEntry>,
}

#[derive(Debug)]
enum BuilderEntry {
    File(FileEntry),
    Directory(Builder),
}

impl Builder {
    fn insert(&mut self, full_path: &str, components: &[&str], file: Option<FileEntry>) -> Result<()> {
        let Some((name, rest)) = components.split_first() else {
            return match file {
                None => Ok(()),
                Some(_) => Err(Error::invalid_path(full_path, "file path is empty")),
            };
        };

        if rest.is_empty()
            && let Some(file) = file
        {
            return match self.entries.get(*name) {
                None => {
                    self.entries
                        .insert((*name).to_string(), BuilderEntry::File(file));
                    Ok(())
                }
                Some(BuilderEntry::File(existing)) if *existing == file => Ok(()),
                Some(BuilderEntry::File(existing)) => Err(Error::conflict(
                    full_path,
                    format!("file declared as {} and {}", existing.digest, file.digest),
                )),
                Some(BuilderEntry::Directory(_)) => Err(Error::conflict(
                    full_path,
                    "declared as both a file and a directory",
                )),
            };
        }

        let child = self
            .entries
            .entry((*name).to_string())
            .or_insert_with(|| BuilderEntry::Directory(Self::default()));
        match child {
            BuilderEntry::Directory(dir) => dir.insert(full_path, rest, file),
            BuilderEntry::File(_) => Err(Error::conflict(
                full_path,
                "a parent path is declared as a file",
            )),
        }
    }

    fn finish(self) -> Result<DirectoryTree> {
        let mut entries = BTreeMap::new();
        for (name, entry) in self.entries {
            let entry = match entry {
                BuilderEntry::File(file) => TreeEntry::File(file),
                BuilderEntry::Directory(dir) => TreeEntry::Directory(dir.finish()?),
            };
            entries.insert(name, entry);
        }
        DirectoryTree::from_entries(entries)
    }
}

/// An immutable directory tree with a precomputed digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryTree {
    entries: BTreeMap<String, TreeEntry>,
    digest: Digest,
}

impl Default for DirectoryTree {
    fn default() -> Self {
        Self::empty()
    }
}

impl DirectoryTree {
    /// The empty directory
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            digest: *EMPTY_DIRECTORY_DIGEST,
        }
    }

    /// Build a tree from already-constructed entries
    ///
    /// # Errors
    ///
    /// Returns an invalid path error if a name is empty or contains a slash
    pub fn from_entries(entries: BTreeMap<String, TreeEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Ok(Self::empty());
        }
        if let Some(bad) = entries
            .keys()
            .find(|name| name.is_empty() || name.contains('/') || *name == "." || *name == "..")
        {
            return Err(Error::invalid_path(bad.clone(), "not a valid entry name"));
        }
        let mut tree = Self {
            entries,
            digest: *EMPTY_DIRECTORY_DIGEST,
        };
        tree.digest = Digest::of_bytes(&tree.node().encode()?);
        Ok(tree)
    }

    /// Build a tree from `(path, file)` pairs
    ///
    /// Identical duplicates collapse into a single entry.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if a path is declared with different contents,
    /// or an invalid path error for absolute or escaping paths
    pub fn from_files<I, S>(files: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, FileEntry)>,
        S: AsRef<str>,
    {
        Self::from_paths(
            files
                .into_iter()
                .map(|(path, file)| (path.as_ref().to_string(), Some(file))),
        )
    }

    /// Build a tree from files (`Some`) and empty directories (`None`)
    ///
    /// # Errors
    ///
    /// See [`DirectoryTree::from_files`]
    pub fn from_paths<I>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Option<FileEntry>)>,
    {
        let mut builder = Builder::default();
        for (path, file) in paths {
            let components = path_components(&path)?;
            builder.insert(&path, &components, file)?;
        }
        builder.finish()
    }

    /// Digest of this tree's root node
    #[must_use]
    pub const fn digest(&self) -> Digest {
        self.digest
    }

    /// Whether the tree has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-level entries
    #[must_use]
    pub const fn entries(&self) -> &BTreeMap<String, TreeEntry> {
        &self.entries
    }

    /// The serialized form of this directory level
    #[must_use]
    pub fn node(&self) -> DirectoryNode {
        let mut files = Vec::new();
        let mut directories = Vec::new();
        for (name, entry) in &self.entries {
            match entry {
                TreeEntry::File(file) => files.push(FileNode {
                    name: name.clone(),
                    digest: file.digest,
                    is_executable: file.is_executable,
                }),
                TreeEntry::Directory(dir) => directories.push(ChildNode {
                    name: name.clone(),
                    digest: dir.digest,
                }),
            }
        }
        DirectoryNode { files, directories }
    }

    /// Look up an entry by relative path
    #[must_use]
    pub fn entry(&self, path: &str) -> Option<&TreeEntry> {
        let components = path_components(path).ok()?;
        let (last, parents) = components.split_last()?;
        let mut current = self;
        for name in parents {
            match current.entries.get(*name)? {
                TreeEntry::Directory(dir) => current = dir,
                TreeEntry::File(_) => return None,
            }
        }
        current.entries.get(*last)
    }

    /// All files with their full relative paths, sorted by path
    #[must_use]
    pub fn files(&self) -> Vec<(String, FileEntry)> {
        let mut out = Vec::new();
        self.collect_files("", &mut out);
        out
    }

    fn collect_files(&self, prefix: &str, out: &mut Vec<(String, FileEntry)>) {
        for (name, entry) in &self.entries {
            let path = join(prefix, name);
            match entry {
                TreeEntry::File(file) => out.push((path, *file)),
                TreeEntry::Directory(dir) => dir.collect_files(&path, out),
            }
        }
    }

    /// All directory paths (excluding the root), sorted
    #[must_use]
    pub fn directories(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_directories("", &mut out);
        out
    }

    fn collect_directories(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, entry) in &self.entries {
            if let TreeEntry::Directory(dir) = entry {
                let path = join(prefix, name);
                out.push(path.clone());
                dir.collect_directories(&path, out);
            }
        }
    }

    /// Visit this tree and every nested tree, parents first
    pub fn walk_trees<'a>(&'a self, f: &mut impl FnMut(&'a Self)) {
        f(self);
        for entry in self.entries.values() {
            if let TreeEntry::Directory(dir) = entry {
                dir.walk_trees(f);
            }
        }
    }

    /// Every digest this tree references: its nodes and its file contents
    #[must_use]
    pub fn reachable_digests(&self) -> Vec<Digest> {
        let mut out = Vec::new();
        self.walk_trees(&mut |tree| {
            out.push(tree.digest);
            for entry in tree.entries.values() {
                if let TreeEntry::File(file) = entry {
                    out.push(file.digest);
                }
            }
        });
        out
    }

    /// Merge trees into their union
    ///
    /// Files present with identical contents in several inputs appear once.
    ///
    /// # Errors
    ///
    /// Returns a conflict error naming the path when two inputs declare
    /// different contents, or a file and a directory, at the same path
    pub fn merge(trees: Vec<Self>) -> Result<Self> {
        Self::merge_at("", trees)
    }

    fn merge_at(parent: &str, mut trees: Vec<Self>) -> Result<Self> {
        trees.retain(|t| !t.is_empty());
        if trees.len() <= 1 {
            return Ok(trees.pop().unwrap_or_default());
        }
        let first = trees[0].digest;
        if trees.iter().all(|t| t.digest == first) {
            return Ok(trees.swap_remove(0));
        }

        let mut grouped: BTreeMap<String, Vec<TreeEntry>> = BTreeMap::new();
        for tree in trees {
            for (name, entry) in tree.entries {
                grouped.entry(name).or_default().push(entry);
            }
        }

        let mut entries = BTreeMap::new();
        for (name, group) in grouped {
            let path = join(parent, &name);
            let merged = Self::merge_group(&path, group)?;
            entries.insert(name, merged);
        }
        Self::from_entries(entries)
    }

    fn merge_group(path: &str, mut group: Vec<TreeEntry>) -> Result<TreeEntry> {
        if group.len() == 1 {
            return Ok(group.swap_remove(0));
        }
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        for entry in group {
            match entry {
                TreeEntry::File(file) => files.push(file),
                TreeEntry::Directory(dir) => dirs.push(dir),
            }
        }
        match (files.first(), dirs.is_empty()) {
            (Some(_), false) => Err(Error::conflict(
                path,
                "declared as both a file and a directory",
            )),
            (Some(first), true) => {
                if let Some(other) = files.iter().find(|f| *f != first) {
                    return Err(Error::conflict(
                        path,
                        format!(
                            "file declared as {}{} and {}{}",
                            first.digest,
                            if first.is_executable { " (executable)" } else { "" },
                            other.digest,
                            if other.is_executable { " (executable)" } else { "" },
                        ),
                    ));
                }
                Ok(TreeEntry::File(*first))
            }
            (None, _) => Ok(TreeEntry::Directory(Self::merge_at(path, dirs)?)),
        }
    }

    /// Nest this tree under `prefix`
    ///
    /// # Errors
    ///
    /// Returns an invalid path error if the prefix is absolute or escapes
    pub fn add_prefix(self, prefix: &str) -> Result<Self> {
        let components = path_components(prefix)?;
        let mut tree = self;
        for name in components.into_iter().rev() {
            let mut entries = BTreeMap::new();
            entries.insert(name.to_string(), TreeEntry::Directory(tree));
            tree = Self::from_entries(entries)?;
        }
        Ok(tree)
    }

    /// Strip `prefix` from every path in this tree
    ///
    /// # Errors
    ///
    /// Returns an invalid path error if the prefix does not name a directory
    /// in this tree or if any entry lies outside of it
    pub fn remove_prefix(self, prefix: &str) -> Result<Self> {
        let components = path_components(prefix)?;
        let mut tree = self;
        let mut walked = String::new();
        for name in components {
            walked = join(&walked, name);
            if tree.entries.len() > 1 {
                let outside: Vec<_> = tree
                    .entries
                    .keys()
                    .filter(|k| k.as_str() != name)
                    .cloned()
                    .collect();
                return Err(Error::invalid_path(
                    prefix,
                    format!("tree contains entries outside of the prefix: {}", outside.join(", ")),
                ));
            }
            match tree.entries.remove(name) {
                Some(TreeEntry::Directory(dir)) => tree = dir,
                Some(TreeEntry::File(_)) => {
                    return Err(Error::invalid_path(
                        prefix,
                        format!("'{walked}' is a file, not a directory"),
                    ));
                }
                None => {
                    return Err(Error::invalid_path(
                        prefix,
                        format!("'{walked}' does not exist in the tree"),
                    ));
                }
            }
        }
        Ok(tree)
    }

    /// The subtree containing only the given paths
    ///
    /// A path naming a directory includes everything below it. Paths that do
    /// not exist are ignored.
    ///
    /// # Errors
    ///
    /// Returns an invalid path error for absolute or escaping paths
    pub fn subset<S: AsRef<str>>(&self, paths: &[S]) -> Result<Self> {
        let mut parts = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let components = path_components(path)?;
            if components.is_empty() {
                return Ok(self.clone());
            }
            let Some(entry) = self.entry(path) else {
                continue;
            };
            let mut current = entry.clone();
            for name in components.iter().rev() {
                let mut entries = BTreeMap::new();
                entries.insert((*name).to_string(), current);
                current = TreeEntry::Directory(Self::from_entries(entries)?);
            }
            if let TreeEntry::Directory(tree) = current {
                parts.push(tree);
            }
        }
        Self::merge(parts)
    }
}
