//! Process execution as an engine intrinsic.
//!
//! A [`Process`] runs in a fresh sandbox directory into which its input
//! digest is materialized. Stdout, stderr and the declared outputs are
//! captured into the store. Results are cached in the action cache under the
//! fingerprint of the full request, so an identical request in a later
//! session (or a later run of the program, with an on-disk store) is served
//! without spawning anything.

use crate::error::Failure;
use crate::intrinsics::blocking;
use cairn_events::{
    emit_cache_hit, emit_cache_miss, emit_process_completed, emit_process_started,
    emit_process_timeout,
};
use cairn_store::{
    ActionCache, ActionEntry, Digest, DirectoryTree, EMPTY_DIRECTORY_DIGEST, Fingerprint, Store,
    path_components,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Number of lines from stdout/stderr to include when summarizing failures
pub const PROCESS_FAILURE_SNIPPET_LINES: usize = 20;

/// Which results of a process may be served from the action cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessCacheScope {
    /// Cache every result, whatever the exit code
    Always,
    /// Cache only results that exited zero
    #[default]
    Successful,
    /// Never consult or populate the action cache
    Never,
}

/// A request to run a subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Process {
    /// Program and arguments
    pub argv: Vec<String>,
    /// The complete environment of the process
    pub env: BTreeMap<String, String>,
    /// Directory tree materialized into the sandbox
    pub input_digest: Digest,
    /// Directory inside the sandbox to run in, relative to its root
    pub working_directory: Option<String>,
    /// Files to capture, relative to the working directory
    pub output_files: Vec<String>,
    /// Directories to capture, relative to the working directory
    pub output_directories: Vec<String>,
    /// Kill the process after this long
    pub timeout: Option<Duration>,
    /// Human readable description
    pub description: String,
    /// Action cache policy
    pub cache_scope: ProcessCacheScope,
}

impl Process {
    /// A process running `argv` with an empty environment and no inputs
    #[must_use]
    pub fn new<S: Into<String>>(argv: impl IntoIterator<Item = S>) -> Self {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        let description = argv.join(" ");
        Self {
            argv,
            env: BTreeMap::new(),
            input_digest: *EMPTY_DIRECTORY_DIGEST,
            working_directory: None,
            output_files: Vec::new(),
            output_directories: Vec::new(),
            timeout: None,
            description,
            cache_scope: ProcessCacheScope::default(),
        }
    }

    /// Set an environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the input tree
    #[must_use]
    pub const fn input_digest(mut self, digest: Digest) -> Self {
        self.input_digest = digest;
        self
    }

    /// Run in a subdirectory of the sandbox
    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Capture these files
    #[must_use]
    pub fn output_files<S: Into<String>>(mut self, files: impl IntoIterator<Item = S>) -> Self {
        self.output_files.extend(files.into_iter().map(Into::into));
        self
    }

    /// Capture these directories
    #[must_use]
    pub fn output_directories<S: Into<String>>(mut self, dirs: impl IntoIterator<Item = S>) -> Self {
        self.output_directories.extend(dirs.into_iter().map(Into::into));
        self
    }

    /// Kill the process after `timeout`
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the description
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the action cache policy
    #[must_use]
    pub const fn cache_scope(mut self, scope: ProcessCacheScope) -> Self {
        self.cache_scope = scope;
        self
    }

    /// Action cache key: the hash of the command, its environment, inputs,
    /// declared outputs and timeout. The description and cache scope are not
    /// part of the key.
    ///
    /// # Errors
    ///
    /// Returns [`Failure::Serialization`] if the request cannot be serialized
    pub fn fingerprint(&self) -> Result<Fingerprint, Failure> {
        let key = ActionKey {
            argv: &self.argv,
            env: &self.env,
            input_digest: self.input_digest,
            working_directory: self.working_directory.as_deref(),
            output_files: &self.output_files,
            output_directories: &self.output_directories,
            timeout: self.timeout,
        };
        let json = serde_json::to_vec(&key).map_err(|e| Failure::Serialization {
            type_name: "Process".to_string(),
            message: e.to_string(),
        })?;
        Ok(Fingerprint::from_data(&json))
    }
}

#[derive(Serialize)]
struct ActionKey<'a> {
    argv: &'a [String],
    env: &'a BTreeMap<String, String>,
    input_digest: Digest,
    working_directory: Option<&'a str>,
    output_files: &'a [String],
    output_directories: &'a [String],
    timeout: Option<Duration>,
}

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessResultSource {
    /// The process was spawned
    Ran,
    /// The result was read from the action cache
    Cached,
}

/// Facts about how a result was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessResultMetadata {
    /// Wall time of the run that produced the result
    pub elapsed_ms: u64,
    /// Where this copy of the result came from
    pub source: ProcessResultSource,
}

/// The result of a process, whatever its exit code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FallibleProcessResult {
    /// Digest of captured stdout
    pub stdout_digest: Digest,
    /// Digest of captured stderr
    pub stderr_digest: Digest,
    /// Exit code; -1 if the process was killed by a signal
    pub exit_code: i32,
    /// Tree of the captured output files and directories
    pub output_digest: Digest,
    /// How the result was produced
    pub metadata: ProcessResultMetadata,
}

impl FallibleProcessResult {
    /// Require a zero exit code
    ///
    /// # Errors
    ///
    /// Returns [`Failure::ProcessExecution`] with the tail of stdout and
    /// stderr if the process exited non-zero
    pub fn into_strict(self, description: &str, store: &Store) -> Result<ProcessResult, Failure> {
        if self.exit_code == 0 {
            return Ok(ProcessResult {
                stdout_digest: self.stdout_digest,
                stderr_digest: self.stderr_digest,
                output_digest: self.output_digest,
                metadata: self.metadata,
            });
        }
        let stdout = store.read(self.stdout_digest).unwrap_or_default();
        let stderr = store.read(self.stderr_digest).unwrap_or_default();
        Err(Failure::ProcessExecution {
            description: description.to_string(),
            exit_code: self.exit_code,
            summary: summarize_output(
                &String::from_utf8_lossy(&stdout),
                &String::from_utf8_lossy(&stderr),
                PROCESS_FAILURE_SNIPPET_LINES,
            ),
        })
    }
}

/// The result of a process that exited zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessResult {
    /// Digest of captured stdout
    pub stdout_digest: Digest,
    /// Digest of captured stderr
    pub stderr_digest: Digest,
    /// Tree of the captured output files and directories
    pub output_digest: Digest,
    /// How the result was produced
    pub metadata: ProcessResultMetadata,
}

/// Build a compact summary of a failed process from the tail of its output.
#[must_use]
pub fn summarize_output(stdout: &str, stderr: &str, max_lines: usize) -> String {
    [
        summarize_stream("stdout", stdout, max_lines),
        summarize_stream("stderr", stderr, max_lines),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join("\n\n")
}

fn summarize_stream(label: &str, content: &str, max_lines: usize) -> Option<String> {
    let normalized = content.trim_end();
    if normalized.is_empty() {
        return None;
    }

    let lines: Vec<&str> = normalized.lines().collect();
    let total = lines.len();
    let start = total.saturating_sub(max_lines);
    let snippet = lines[start..].join("\n");

    let header = if total > max_lines {
        format!("{label} (last {max_lines} of {total} lines):")
    } else {
        format!("{label}:")
    };

    Some(format!("{header}\n{snippet}"))
}

/// Runs processes locally, consulting and populating the action cache.
pub(crate) struct CommandRunner {
    store: Store,
    action_cache: ActionCache,
    semaphore: Semaphore,
    cache_enabled: bool,
    keep_sandboxes: bool,
    default_timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new(
        store: Store,
        action_cache: ActionCache,
        max_parallel: usize,
        cache_enabled: bool,
        keep_sandboxes: bool,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            action_cache,
            semaphore: Semaphore::new(max_parallel.max(1)),
            cache_enabled,
            keep_sandboxes,
            default_timeout,
        }
    }

    pub const fn action_cache(&self) -> &ActionCache {
        &self.action_cache
    }

    pub async fn run(&self, process: &Process) -> Result<FallibleProcessResult, Failure> {
        let use_cache = self.cache_enabled && process.cache_scope != ProcessCacheScope::Never;
        let key = process.fingerprint()?;

        if use_cache {
            if let Some(result) = self.lookup(&key) {
                emit_cache_hit!("action", process.description);
                return Ok(result);
            }
            emit_cache_miss!("action", process.description);
        }

        let result = self.execute(process).await?;

        let cacheable = match process.cache_scope {
            ProcessCacheScope::Always => true,
            ProcessCacheScope::Successful => result.exit_code == 0,
            ProcessCacheScope::Never => false,
        };
        if use_cache && cacheable {
            if let Err(e) = self.record(key, process, &result) {
                warn!(error = %e, description = %process.description, "Failed to cache process result");
            }
        }
        Ok(result)
    }

    /// A cached result, provided everything it refers to is still stored.
    fn lookup(&self, key: &Fingerprint) -> Option<FallibleProcessResult> {
        let entry = self.action_cache.get(key)?;
        let bytes = self.store.read(entry.digest).ok()?;
        let mut result: FallibleProcessResult = match serde_json::from_slice(&bytes) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, key = %key, "Ignoring undecodable action cache entry");
                return None;
            }
        };
        if !self.outputs_present(&result) {
            debug!(key = %key, "Action cache entry refers to missing content");
            return None;
        }
        result.metadata.source = ProcessResultSource::Cached;
        Some(result)
    }

    fn outputs_present(&self, result: &FallibleProcessResult) -> bool {
        self.store.contains(result.stdout_digest)
            && self.store.contains(result.stderr_digest)
            && self
                .store
                .load_directory(result.output_digest)
                .is_ok_and(|tree| {
                    tree.files()
                        .iter()
                        .all(|(_, file)| self.store.contains(file.digest))
                })
    }

    fn record(
        &self,
        key: Fingerprint,
        process: &Process,
        result: &FallibleProcessResult,
    ) -> Result<(), Failure> {
        let bytes = serde_json::to_vec(result).map_err(|e| Failure::Serialization {
            type_name: "FallibleProcessResult".to_string(),
            message: e.to_string(),
        })?;
        let digest = self.store.write(bytes)?;
        self.action_cache
            .put(key, ActionEntry::new(digest, process.description.clone()))?;
        Ok(())
    }

    async fn execute(&self, process: &Process) -> Result<FallibleProcessResult, Failure> {
        let Some((program, args)) = process.argv.split_first() else {
            return Err(Failure::Io {
                operation: format!("spawn '{}'", process.description),
                message: "argv is empty".to_string(),
            });
        };
        for path in process
            .output_files
            .iter()
            .chain(&process.output_directories)
            .chain(&process.working_directory)
        {
            path_components(path)?;
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Failure::Cancelled)?;

        let sandbox = tempfile::Builder::new()
            .prefix("cairn-sandbox-")
            .tempdir()
            .map_err(|e| Failure::io("create sandbox", &e))?;
        let workdir = self.prepare_sandbox(process, sandbox.path()).await?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(&process.env)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        emit_process_started!(process.description, process.argv);
        let started = Instant::now();
        let child = command
            .spawn()
            .map_err(|e| Failure::io(format!("spawn '{program}'"), &e))?;

        let waiting = child.wait_with_output();
        let output = match process.timeout.or(self.default_timeout) {
            Some(limit) => {
                if let Ok(output) = tokio::time::timeout(limit, waiting).await {
                    output
                } else {
                    let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    emit_process_timeout!(process.description, timeout_ms);
                    return Err(Failure::ProcessTimeout {
                        description: process.description.clone(),
                        timeout_ms,
                    });
                }
            }
            None => waiting.await,
        }
        .map_err(|e| Failure::io(format!("wait for '{program}'"), &e))?;

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        emit_process_completed!(
            process.description,
            output.status.success(),
            output.status.code(),
            elapsed_ms
        );

        let stdout_digest = self.store.write(output.stdout)?;
        let stderr_digest = self.store.write(output.stderr)?;
        let output_digest = self.capture_outputs(process, workdir).await?;

        if self.keep_sandboxes {
            let kept = sandbox.keep();
            info!(path = %kept.display(), description = %process.description, "Preserved sandbox");
        }

        Ok(FallibleProcessResult {
            stdout_digest,
            stderr_digest,
            exit_code: output.status.code().unwrap_or(-1),
            output_digest,
            metadata: ProcessResultMetadata {
                elapsed_ms,
                source: ProcessResultSource::Ran,
            },
        })
    }

    /// Materialize the inputs and create the working directory and the
    /// parents of every output path.
    async fn prepare_sandbox(&self, process: &Process, root: &Path) -> Result<PathBuf, Failure> {
        let store = self.store.clone();
        let input = process.input_digest;
        let destination = root.to_path_buf();
        blocking(move || store.materialize(input, &destination)).await?;

        let mut workdir = root.to_path_buf();
        if let Some(dir) = &process.working_directory {
            workdir.extend(path_components(dir)?);
        }
        let mut dirs = vec![workdir.clone()];
        for file in &process.output_files {
            if let Some(parent) = workdir.join(file).parent() {
                dirs.push(parent.to_path_buf());
            }
        }
        dirs.extend(process.output_directories.iter().map(|dir| workdir.join(dir)));
        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .map_err(|e| Failure::io(format!("create {}", dir.display()), &e))?;
        }
        Ok(workdir)
    }

    async fn capture_outputs(&self, process: &Process, workdir: PathBuf) -> Result<Digest, Failure> {
        let store = self.store.clone();
        let mut paths: Vec<String> = process.output_files.clone();
        paths.extend(process.output_directories.iter().cloned());
        blocking(move || {
            if paths.is_empty() {
                return store.record_directory(&DirectoryTree::empty());
            }
            let everything = store.snapshot_path(&workdir)?;
            store.subset(everything, &paths)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_fingerprint() {
        let a = Process::new(["echo", "hi"]).env("A", "1");
        let b = Process::new(["echo", "hi"]).env("A", "1");
        let c = Process::new(["echo", "hi"]).env("A", "2");
        assert_eq!(a.description, "echo hi");
        assert_eq!(a.input_digest, *EMPTY_DIRECTORY_DIGEST);
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_ne!(a.fingerprint().unwrap(), c.fingerprint().unwrap());
    }

    #[test]
    fn test_fingerprint_ignores_description_and_scope() {
        let plain = Process::new(["echo", "hi"]);
        let described = Process::new(["echo", "hi"])
            .description("say hi")
            .cache_scope(ProcessCacheScope::Always);
        assert_eq!(plain.fingerprint().unwrap(), described.fingerprint().unwrap());

        let timed = Process::new(["echo", "hi"]).timeout(Duration::from_secs(5));
        assert_ne!(plain.fingerprint().unwrap(), timed.fingerprint().unwrap());
    }

    #[tokio::test]
    async fn test_cache_hit_across_descriptions() {
        let runner = CommandRunner::new(Store::memory(), ActionCache::memory(), 1, true, false, None);
        let first = runner
            .run(&Process::new(["/bin/sh", "-c", "echo hi"]).description("first"))
            .await
            .unwrap();
        assert_eq!(first.metadata.source, ProcessResultSource::Ran);
        let second = runner
            .run(&Process::new(["/bin/sh", "-c", "echo hi"]).description("second"))
            .await
            .unwrap();
        assert_eq!(second.metadata.source, ProcessResultSource::Cached);
    }

    #[test]
    fn test_summarize_keeps_tail() {
        let stdout = (1..=30).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let summary = summarize_output(&stdout, "", 5);
        assert!(summary.starts_with("stdout (last 5 of 30 lines):"));
        assert!(summary.contains("line 30"));
        assert!(!summary.contains("line 25\n"));
        assert!(!summary.contains("stderr"));
    }

    #[test]
    fn test_summarize_empty_output() {
        assert_eq!(summarize_output("", "  \n", 5), "");
    }

    #[test]
    fn test_into_strict() {
        let store = Store::memory();
        let stderr = store.write(&b"boom\n"[..]).unwrap();
        let result = FallibleProcessResult {
            stdout_digest: cairn_store::EMPTY_DIGEST,
            stderr_digest: stderr,
            exit_code: 3,
            output_digest: *EMPTY_DIRECTORY_DIGEST,
            metadata: ProcessResultMetadata {
                elapsed_ms: 1,
                source: ProcessResultSource::Ran,
            },
        };
        match result.clone().into_strict("fail", &store) {
            Err(Failure::ProcessExecution {
                exit_code, summary, ..
            }) => {
                assert_eq!(exit_code, 3);
                assert_eq!(summary, "stderr:\nboom");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let ok = FallibleProcessResult {
            exit_code: 0,
            ..result
        };
        assert!(ok.into_strict("ok", &store).is_ok());
    }

    #[tokio::test]
    async fn test_runs_and_caches() {
        let store = Store::memory();
        let runner = CommandRunner::new(store.clone(), ActionCache::memory(), 2, true, false, None);
        let process = Process::new(["/bin/sh", "-c", "echo out; echo made > result.txt"])
            .output_files(["result.txt"]);

        let first = runner.run(&process).await.unwrap();
        assert_eq!(first.exit_code, 0);
        assert_eq!(first.metadata.source, ProcessResultSource::Ran);
        assert_eq!(&store.read(first.stdout_digest).unwrap()[..], b"out\n");
        let files = store.contents(first.output_digest).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "result.txt");

        let second = runner.run(&process).await.unwrap();
        assert_eq!(second.metadata.source, ProcessResultSource::Cached);
        assert_eq!(second.output_digest, first.output_digest);
    }

    #[tokio::test]
    async fn test_failed_result_is_not_cached_by_default() {
        let runner = CommandRunner::new(Store::memory(), ActionCache::memory(), 1, true, false, None);
        let process = Process::new(["/bin/sh", "-c", "exit 4"]);
        let first = runner.run(&process).await.unwrap();
        assert_eq!(first.exit_code, 4);
        let second = runner.run(&process).await.unwrap();
        assert_eq!(second.metadata.source, ProcessResultSource::Ran);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let runner = CommandRunner::new(Store::memory(), ActionCache::memory(), 1, true, false, None);
        let process = Process::new(["/bin/sh", "-c", "sleep 30"])
            .env("PATH", "/usr/bin:/bin")
            .timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = runner.run(&process).await.unwrap_err();
        assert!(matches!(err, Failure::ProcessTimeout { timeout_ms: 100, .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_inputs_are_materialized() {
        let store = Store::memory();
        let input = store
            .snapshot(vec![cairn_store::FileContent::new("src/data.txt", "payload")])
            .unwrap();
        let runner = CommandRunner::new(store.clone(), ActionCache::memory(), 1, false, false, None);
        let process = Process::new(["/bin/sh", "-c", "cat data.txt"])
            .env("PATH", "/usr/bin:/bin")
            .input_digest(input)
            .working_directory("src");
        let result = runner.run(&process).await.unwrap();
        assert_eq!(&store.read(result.stdout_digest).unwrap()[..], b"payload");
    }

    #[tokio::test]
    async fn test_escaping_output_path_is_rejected() {
        let runner = CommandRunner::new(Store::memory(), ActionCache::memory(), 1, false, false, None);
        let process = Process::new(["/bin/true"]).output_files(["../outside"]);
        assert!(matches!(
            runner.run(&process).await,
            Err(Failure::Store { .. })
        ));
    }

    #[tokio::test]
    async fn test_escaping_working_directory_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let escaped = outside.path().join("escaped");
        let runner = CommandRunner::new(Store::memory(), ActionCache::memory(), 1, false, false, None);

        let absolute = Process::new(["/bin/sh", "-c", "echo leaked > marker"])
            .working_directory(escaped.to_string_lossy());
        assert!(matches!(
            runner.run(&absolute).await,
            Err(Failure::Store { .. })
        ));
        assert!(!escaped.exists());

        let parent = Process::new(["/bin/sh", "-c", "echo leaked > marker"])
            .working_directory("src/../../up");
        assert!(matches!(
            runner.run(&parent).await,
            Err(Failure::Store { .. })
        ));
    }

    #[tokio::test]
    async fn test_nested_working_directory_stays_in_sandbox() {
        let store = Store::memory();
        let runner = CommandRunner::new(store.clone(), ActionCache::memory(), 1, false, false, None);
        let process = Process::new(["/bin/sh", "-c", "echo made > out.txt"])
            .working_directory("./a//b/")
            .output_files(["out.txt"]);
        let result = runner.run(&process).await.unwrap();
        let files = store.contents(result.output_digest).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "out.txt");
    }
}
