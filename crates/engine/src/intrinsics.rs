//! Rules supplied by the engine.
//!
//! User rules reach these through ordinary Gets, for example
//! `.get::<ProcessResult, Process>()` or `.get::<Digest, MergeDigests>()`.
//! Directory operations run on the blocking pool since the store may touch
//! disk. Workspace reads go through a memoized glob node, so
//! [`Scheduler::invalidate_paths`](crate::Scheduler::invalidate_paths) can
//! clear exactly the snapshots a changed file affects.

use crate::context::RuleContext;
use crate::error::Failure;
use crate::fs::{DigestEntries, DigestEntry, PathGlobs, Paths, Snapshot};
use crate::process::{FallibleProcessResult, Process, ProcessResult};
use crate::rule::Rule;
use cairn_store::{Digest, FileContent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A file to create, or a file read back from a digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileSpec {
    /// Path relative to the tree root
    pub path: String,
    /// File bytes
    pub content: Vec<u8>,
    /// Executable bit
    pub is_executable: bool,
}

impl FileSpec {
    /// A non-executable file
    #[must_use]
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            is_executable: false,
        }
    }

    /// Mark the file executable
    #[must_use]
    pub const fn executable(mut self) -> Self {
        self.is_executable = true;
        self
    }
}

/// Request to build a tree from literal files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreateDigest(pub Vec<FileSpec>);

/// Request for the union of several trees.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeDigests(pub Vec<Digest>);

/// Request to nest a tree under a directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddPrefix {
    /// Tree to nest
    pub digest: Digest,
    /// Relative directory to nest it under
    pub prefix: String,
}

/// Request to strip a leading directory from every path of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemovePrefix {
    /// Tree to strip
    pub digest: Digest,
    /// Directory every path must lie under
    pub prefix: String,
}

/// Request for the part of a tree under the given paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DigestSubset {
    /// Tree to select from
    pub digest: Digest,
    /// Files or directories to keep
    pub paths: Vec<String>,
}

/// Every file of a tree with its bytes, in path order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DigestContents(pub Vec<FileSpec>);

impl DigestContents {
    /// The file at `path`
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&FileSpec> {
        self.0.iter().find(|file| file.path == path)
    }
}

/// Run a store or filesystem operation on the blocking pool.
pub(crate) async fn blocking<T, E, F>(operation: F) -> Result<T, Failure>
where
    T: Send + 'static,
    E: Into<Failure> + Send + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|e| Failure::Aborted {
            reason: format!("blocking task failed: {e}"),
        })?
        .map_err(Into::into)
}

async fn fallible_process(
    ctx: RuleContext,
    process: Process,
) -> Result<FallibleProcessResult, Failure> {
    ctx.execute_process(process).await
}

async fn strict_process(ctx: RuleContext, process: Process) -> Result<ProcessResult, Failure> {
    let result = ctx.execute_process(process.clone()).await?;
    result.into_strict(&process.description, ctx.store())
}

async fn create_digest(ctx: RuleContext, request: CreateDigest) -> Result<Digest, Failure> {
    let store = ctx.store().clone();
    let files = request
        .0
        .into_iter()
        .map(|file| FileContent {
            path: file.path,
            content: file.content.into(),
            is_executable: file.is_executable,
        })
        .collect();
    blocking(move || store.snapshot(files)).await
}

async fn merge_digests(ctx: RuleContext, request: MergeDigests) -> Result<Digest, Failure> {
    let store = ctx.store().clone();
    blocking(move || store.merge(&request.0)).await
}

async fn add_prefix(ctx: RuleContext, request: AddPrefix) -> Result<Digest, Failure> {
    let store = ctx.store().clone();
    blocking(move || store.add_prefix(request.digest, &request.prefix)).await
}

async fn remove_prefix(ctx: RuleContext, request: RemovePrefix) -> Result<Digest, Failure> {
    let store = ctx.store().clone();
    blocking(move || store.remove_prefix(request.digest, &request.prefix)).await
}

async fn digest_subset(ctx: RuleContext, request: DigestSubset) -> Result<Digest, Failure> {
    let store = ctx.store().clone();
    blocking(move || store.subset(request.digest, &request.paths)).await
}

async fn digest_contents(ctx: RuleContext, digest: Digest) -> Result<DigestContents, Failure> {
    let store = ctx.store().clone();
    let files = blocking(move || store.contents(digest)).await?;
    Ok(DigestContents(
        files
            .into_iter()
            .map(|file| FileSpec {
                path: file.path,
                content: file.content.to_vec(),
                is_executable: file.is_executable,
            })
            .collect(),
    ))
}

async fn path_globs_to_snapshot(ctx: RuleContext, globs: PathGlobs) -> Result<Snapshot, Failure> {
    ctx.snapshot_globs(globs).await
}

async fn path_globs_to_digest(ctx: RuleContext, globs: PathGlobs) -> Result<Digest, Failure> {
    Ok(ctx.snapshot_globs(globs).await?.digest)
}

async fn path_globs_to_paths(ctx: RuleContext, globs: PathGlobs) -> Result<Paths, Failure> {
    let core = Arc::clone(ctx.core());
    blocking(move || core.workspace.expand(&globs)).await
}

async fn digest_to_snapshot(ctx: RuleContext, digest: Digest) -> Result<Snapshot, Failure> {
    let store = ctx.store().clone();
    blocking(move || Snapshot::from_digest(&store, digest)).await
}

async fn digest_entries(ctx: RuleContext, digest: Digest) -> Result<DigestEntries, Failure> {
    let store = ctx.store().clone();
    let entries = blocking(move || store.entries(digest)).await?;
    Ok(DigestEntries(entries.into_iter().map(DigestEntry::from).collect()))
}

/// The engine's own rules
pub(crate) fn rules() -> Vec<Rule> {
    vec![
        Rule::new("cairn::fallible_process", fallible_process).intrinsic(),
        Rule::new("cairn::process", strict_process).intrinsic(),
        Rule::new("cairn::create_digest", create_digest).intrinsic(),
        Rule::new("cairn::merge_digests", merge_digests).intrinsic(),
        Rule::new("cairn::add_prefix", add_prefix).intrinsic(),
        Rule::new("cairn::remove_prefix", remove_prefix).intrinsic(),
        Rule::new("cairn::digest_subset", digest_subset).intrinsic(),
        Rule::new("cairn::digest_contents", digest_contents).intrinsic(),
        Rule::new("cairn::digest_entries", digest_entries).intrinsic(),
        Rule::new("cairn::digest_to_snapshot", digest_to_snapshot).intrinsic(),
        Rule::new("cairn::path_globs_to_snapshot", path_globs_to_snapshot).intrinsic(),
        Rule::new("cairn::path_globs_to_digest", path_globs_to_digest).intrinsic(),
        Rule::new("cairn::path_globs_to_paths", path_globs_to_paths).intrinsic(),
    ]
}
