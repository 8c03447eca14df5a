//! Engine configuration.
//!
//! Resolution order: defaults, then a TOML file (explicit path or
//! `CAIRN_CONFIG`), then `CAIRN_*` environment overrides. Callers such as
//! the CLI apply their own flags last.

use crate::error::{Error, Result};
use cairn_store::{ActionCache, DEFAULT_MEMORY_CACHE_BYTES, Store};
use dirs::{cache_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "CAIRN_CONFIG";
/// Environment variable overriding the cache root
pub const CACHE_DIR_ENV: &str = "CAIRN_CACHE_DIR";
/// Environment variable overriding `store.dir`
pub const STORE_DIR_ENV: &str = "CAIRN_STORE_DIR";
/// Environment variable overriding `process.max_parallel`
pub const MAX_PARALLEL_ENV: &str = "CAIRN_MAX_PARALLEL_PROCESSES";

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Content-addressed store settings
    pub store: StoreConfig,
    /// Process execution settings
    pub process: ProcessConfig,
    /// Memo graph settings
    pub graph: GraphConfig,
    /// Workspace read by path globs
    pub workspace: WorkspaceConfig,
}

/// `[store]` settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Store root; the resolved cache root when unset
    pub dir: Option<PathBuf>,
    /// Size bound applied by garbage collection
    pub max_size_bytes: Option<u64>,
    /// Bound on blobs cached in memory in front of the on-disk tier
    pub memory_cache_bytes: Option<u64>,
    /// Keep everything in memory
    pub memory_only: bool,
}

/// `[process]` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessConfig {
    /// Maximum concurrently running processes
    pub max_parallel: usize,
    /// Timeout for processes that set none; 0 disables it
    pub default_timeout_secs: u64,
    /// Consult and populate the action cache
    pub cache: bool,
    /// Leave sandboxes on disk after the process exits
    pub keep_sandboxes: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism().map_or(4, usize::from),
            default_timeout_secs: 0,
            cache: true,
            keep_sandboxes: false,
        }
    }
}

/// `[graph]` settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    /// Evict least recently used entries beyond this count; 0 is unbounded
    pub max_entries: usize,
}

/// `[workspace]` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    /// Root that path globs are relative to; the current directory when unset
    pub root: Option<PathBuf>,
    /// Globs that path globs never match, such as `dist` or `**/*.pyc`
    pub ignore: Vec<String>,
    /// Skip paths excluded by `.gitignore` files
    pub respect_gitignore: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: None,
            ignore: vec![".git".to_string()],
            respect_gitignore: true,
        }
    }
}

impl WorkspaceConfig {
    /// The configured root, or the current directory
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the current directory cannot be determined
    pub fn resolve_root(&self) -> Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => std::env::current_dir()
                .map_err(|e| Error::io(e, ".", "resolve workspace root")),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on invalid TOML or unknown keys
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| Error::configuration(format!("invalid config: {e}")))
    }

    /// Load from `path`, or from `CAIRN_CONFIG` when no path is given, then
    /// apply environment overrides
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// is malformed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(|| {
            std::env::var_os(CONFIG_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        });
        let mut config = match path {
            Some(path) => {
                debug!(path = %path.display(), "Loading engine config");
                let source = std::fs::read_to_string(&path)
                    .map_err(|e| Error::io(e, &path, "read config"))?;
                Self::from_toml_str(&source)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `CAIRN_STORE_DIR` and `CAIRN_MAX_PARALLEL_PROCESSES`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a value is malformed
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup(STORE_DIR_ENV).filter(|s| !s.trim().is_empty()) {
            self.store.dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup(MAX_PARALLEL_ENV).filter(|s| !s.trim().is_empty()) {
            let parsed: usize = value.trim().parse().map_err(|_| {
                Error::configuration(format!("{MAX_PARALLEL_ENV} must be a positive integer, got '{value}'"))
            })?;
            if parsed == 0 {
                return Err(Error::configuration(format!(
                    "{MAX_PARALLEL_ENV} must be at least 1"
                )));
            }
            self.process.max_parallel = parsed;
        }
        Ok(())
    }

    /// Timeout applied to processes that set none
    #[must_use]
    pub const fn default_timeout(&self) -> Option<Duration> {
        match self.process.default_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Directory holding the blob store and the action cache
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no writable directory is found
    pub fn store_root(&self) -> Result<PathBuf> {
        match &self.store.dir {
            Some(dir) => Ok(dir.clone()),
            None => cache_root(),
        }
    }

    /// Open the configured store and action cache
    ///
    /// # Errors
    ///
    /// Returns an error if the store root cannot be resolved
    pub fn open_store(&self) -> Result<(Store, ActionCache)> {
        if self.store.memory_only {
            return Ok((Store::memory(), ActionCache::memory()));
        }
        let root = self.store_root()?;
        debug!(root = %root.display(), "Opening store");
        Ok((
            Store::local_with_memory_limit(
                root.join("blobs"),
                self.store
                    .memory_cache_bytes
                    .unwrap_or(DEFAULT_MEMORY_CACHE_BYTES),
            ),
            ActionCache::local(root.join("actions")),
        ))
    }
}

/// Inputs for determining the cache root
#[derive(Debug, Clone)]
struct CacheInputs {
    cairn_cache_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_root_from_inputs(inputs: CacheInputs) -> Result<PathBuf> {
    // First writable wins:
    // 1) CAIRN_CACHE_DIR
    // 2) XDG_CACHE_HOME/cairn
    // 3) OS cache dir/cairn
    // 4) ~/.cairn/cache
    // 5) TMPDIR/cairn/cache
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs.cairn_cache_dir.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("cairn"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("cairn"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".cairn/cache"));
    }
    candidates.push(inputs.temp_dir.join("cairn/cache"));

    for path in candidates {
        if path.starts_with("/homeless-shelter") {
            continue;
        }
        // Existing directories may be read-only
        if path.exists() {
            let probe = path.join(".write_probe");
            if std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
                .is_ok()
            {
                let _ = std::fs::remove_file(&probe);
                return Ok(path);
            }
            continue;
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}

fn cache_root() -> Result<PathBuf> {
    let inputs = CacheInputs {
        cairn_cache_dir: std::env::var(CACHE_DIR_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        xdg_cache_home: std::env::var("XDG_CACHE_HOME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        os_cache_dir: cache_dir(),
        home_dir: home_dir(),
        temp_dir: std::env::temp_dir(),
    };
    cache_root_from_inputs(inputs)
}
