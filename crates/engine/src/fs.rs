//! Reading the workspace through path globs.
//!
//! A [`PathGlobs`] is expanded against the workspace root into the matching
//! files and directories, which are then ingested into the store. Globs use
//! `/` separators and are relative to the root; `*` never crosses a
//! separator, `**` matches any number of directories, and a leading `!`
//! excludes. Matched directories are captured without their contents unless
//! their contents match too.
//!
//! Expansions are memoized by their globs. When workspace files change,
//! [`Scheduler::invalidate_paths`](crate::Scheduler::invalidate_paths) clears
//! every expansion a changed path could affect.

use crate::error::Failure;
use cairn_store::{Digest, EMPTY_DIRECTORY_DIGEST, PathEntry, Store};
use glob::{MatchOptions, Pattern};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// What to do when an include glob matches nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobMatchErrorBehavior {
    /// Return what matched
    #[default]
    Ignore,
    /// Log a warning and return what matched
    Warn,
    /// Fail the request
    Error,
}

/// Which include globs must match for the request to count as matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobExpansionConjunction {
    /// Every include glob must match something
    #[default]
    AllMatch,
    /// At least one include glob must match something
    AnyMatch,
}

/// A request for the workspace paths matching a set of globs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathGlobs {
    /// Include globs, and exclude globs prefixed with `!`
    pub globs: Vec<String>,
    /// Handling of unmatched include globs
    pub match_behavior: GlobMatchErrorBehavior,
    /// Which include globs must match
    pub conjunction: GlobExpansionConjunction,
    /// Where the globs came from, for unmatched glob messages
    pub description_of_origin: Option<String>,
}

impl PathGlobs {
    /// Globs whose unmatched includes are ignored
    #[must_use]
    pub fn new<S: Into<String>>(globs: impl IntoIterator<Item = S>) -> Self {
        Self {
            globs: globs.into_iter().map(Into::into).collect(),
            match_behavior: GlobMatchErrorBehavior::Ignore,
            conjunction: GlobExpansionConjunction::AllMatch,
            description_of_origin: None,
        }
    }

    /// Fail when an include glob matches nothing
    #[must_use]
    pub fn error_on_unmatched(mut self, origin: impl Into<String>) -> Self {
        self.match_behavior = GlobMatchErrorBehavior::Error;
        self.description_of_origin = Some(origin.into());
        self
    }

    /// Warn when an include glob matches nothing
    #[must_use]
    pub fn warn_on_unmatched(mut self, origin: impl Into<String>) -> Self {
        self.match_behavior = GlobMatchErrorBehavior::Warn;
        self.description_of_origin = Some(origin.into());
        self
    }

    /// Count the request as matched when any include glob matches
    #[must_use]
    pub const fn any_match(mut self) -> Self {
        self.conjunction = GlobExpansionConjunction::AnyMatch;
        self
    }
}

/// Matched paths, without reading any content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Paths {
    /// Matched files, sorted
    pub files: Vec<String>,
    /// Matched directories, sorted
    pub dirs: Vec<String>,
}

/// A directory digest together with its file and directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snapshot {
    /// The directory tree
    pub digest: Digest,
    /// Every file in the tree, sorted
    pub files: Vec<String>,
    /// Every directory in the tree, sorted
    pub dirs: Vec<String>,
}

impl Snapshot {
    /// The empty snapshot
    #[must_use]
    pub fn empty() -> Self {
        Self {
            digest: *EMPTY_DIRECTORY_DIGEST,
            files: Vec::new(),
            dirs: Vec::new(),
        }
    }

    /// List the tree behind `digest`
    ///
    /// # Errors
    ///
    /// Returns [`Failure::Store`] if the tree is missing
    pub fn from_digest(store: &Store, digest: Digest) -> Result<Self, Failure> {
        let tree = store.load_directory(digest)?;
        Ok(Self {
            digest,
            files: tree.files().into_iter().map(|(path, _)| path).collect(),
            dirs: tree.directories(),
        })
    }
}

/// One file or directory of a tree, without content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DigestEntry {
    /// A file and the digest of its bytes
    File {
        /// Relative path
        path: String,
        /// Digest of the file's bytes
        digest: Digest,
        /// Executable bit
        is_executable: bool,
    },
    /// A directory
    Directory {
        /// Relative path
        path: String,
    },
}

impl From<PathEntry> for DigestEntry {
    fn from(entry: PathEntry) -> Self {
        match entry {
            PathEntry::File {
                path,
                digest,
                is_executable,
            } => Self::File {
                path,
                digest,
                is_executable,
            },
            PathEntry::Directory { path } => Self::Directory { path },
        }
    }
}

/// Every entry of a tree, sorted by path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DigestEntries(pub Vec<DigestEntry>);

/// The workspace root and the globs it never yields.
#[derive(Debug, Clone)]
pub(crate) struct Workspace {
    root: PathBuf,
    ignore: Vec<Pattern>,
    respect_gitignore: bool,
}

impl Workspace {
    pub fn new(root: PathBuf, ignore: &[String], respect_gitignore: bool) -> Result<Self, Failure> {
        let ignore = ignore
            .iter()
            .map(|glob| compile(glob))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            root,
            ignore,
            respect_gitignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Expand `globs` against the workspace.
    pub fn expand(&self, globs: &PathGlobs) -> Result<Paths, Failure> {
        let parsed = ParsedGlobs::parse(globs)?;
        let mut matched = vec![false; parsed.include.len()];
        let mut files = Vec::new();
        let mut dirs = Vec::new();

        let root = self.root.clone();
        let mut excluded: Vec<Pattern> = self.ignore.clone();
        excluded.extend(parsed.exclude.iter().map(|(_, pattern)| pattern.clone()));

        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .git_ignore(self.respect_gitignore)
            .require_git(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                relative(&root, entry.path())
                    .is_none_or(|path| !excluded.iter().any(|p| p.matches_with(&path, MATCH_OPTIONS)))
            })
            .build();

        for entry in walker {
            let entry = entry.map_err(|e| Failure::Io {
                operation: format!("walk {}", self.root.display()),
                message: e.to_string(),
            })?;
            let Some(path) = relative(&self.root, entry.path()) else {
                continue;
            };
            let Some(file_type) = entry.file_type() else {
                continue;
            };
            let mut hit = false;
            for (index, (_, pattern)) in parsed.include.iter().enumerate() {
                if pattern.matches_with(&path, MATCH_OPTIONS) {
                    matched[index] = true;
                    hit = true;
                }
            }
            if !hit {
                continue;
            }
            if file_type.is_dir() {
                dirs.push(path);
            } else if file_type.is_file() {
                files.push(path);
            } else {
                debug!(path = %path, "Skipping non-regular file");
            }
        }

        parsed.check_matched(globs, &matched)?;
        files.sort();
        dirs.sort();
        Ok(Paths { files, dirs })
    }

    /// Expand `globs` and ingest the matches.
    pub fn snapshot(&self, store: &Store, globs: &PathGlobs) -> Result<Snapshot, Failure> {
        let paths = self.expand(globs)?;
        if paths.files.is_empty() && paths.dirs.is_empty() {
            return Ok(Snapshot::empty());
        }
        let digest = store.snapshot_paths(&self.root, &paths.files, &paths.dirs)?;
        Snapshot::from_digest(store, digest)
    }
}

/// Whether a change to `changed`, a path relative to the workspace root,
/// can alter the expansion of `globs`.
pub(crate) fn affected_by(globs: &PathGlobs, changed: &str) -> bool {
    let Ok(parsed) = ParsedGlobs::parse(globs) else {
        return false;
    };
    let changed: Vec<&str> = changed.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    if changed.is_empty() {
        return !parsed.include.is_empty();
    }
    parsed.include.iter().any(|(glob, pattern)| {
        // The path itself or one of its ancestors matches
        let hits_ancestor = (1..=changed.len())
            .any(|len| pattern.matches_with(&changed[..len].join("/"), MATCH_OPTIONS));
        // The path is a directory the glob descends through
        let prefix = literal_prefix(glob);
        let hits_prefix =
            changed.len() <= prefix.len() && changed.iter().zip(&prefix).all(|(a, b)| a == b);
        // The glob has wildcards below a literal prefix containing the path
        let below_prefix = prefix.len() < glob.split('/').count()
            && changed.len() > prefix.len()
            && changed.iter().zip(&prefix).all(|(a, b)| a == b);
        hits_ancestor || hits_prefix || (below_prefix && glob.contains("**"))
    })
}

/// Leading components of a glob that contain no wildcard.
fn literal_prefix(glob: &str) -> Vec<&str> {
    glob.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .take_while(|c| !c.contains(['*', '?', '[']))
        .collect()
}

struct ParsedGlobs {
    include: Vec<(String, Pattern)>,
    exclude: Vec<(String, Pattern)>,
}

impl ParsedGlobs {
    fn parse(globs: &PathGlobs) -> Result<Self, Failure> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for glob in &globs.globs {
            match glob.strip_prefix('!') {
                Some(excluded) => exclude.push((excluded.to_string(), compile(excluded)?)),
                None => include.push((glob.clone(), compile(glob)?)),
            }
        }
        Ok(Self { include, exclude })
    }

    fn check_matched(&self, globs: &PathGlobs, matched: &[bool]) -> Result<(), Failure> {
        if globs.match_behavior == GlobMatchErrorBehavior::Ignore || self.include.is_empty() {
            return Ok(());
        }
        let satisfied = match globs.conjunction {
            GlobExpansionConjunction::AllMatch => matched.iter().all(|m| *m),
            GlobExpansionConjunction::AnyMatch => matched.iter().any(|m| *m),
        };
        if satisfied {
            return Ok(());
        }

        let unmatched: Vec<String> = self
            .include
            .iter()
            .zip(matched)
            .filter(|(_, m)| !**m)
            .map(|((glob, _), _)| format!("\"{glob}\""))
            .collect();
        let mut message = match &globs.description_of_origin {
            Some(origin) => format!("Unmatched glob from {origin}: {}", unmatched.join(", ")),
            None => format!("Unmatched glob: {}", unmatched.join(", ")),
        };
        if !self.exclude.is_empty() {
            let excludes: BTreeSet<String> =
                self.exclude.iter().map(|(glob, _)| format!("\"{glob}\"")).collect();
            message.push_str(", exclude: ");
            message.push_str(&excludes.into_iter().collect::<Vec<_>>().join(", "));
        }

        if globs.match_behavior == GlobMatchErrorBehavior::Error {
            return Err(Failure::Glob { message });
        }
        warn!("{message}");
        Ok(())
    }
}

/// Compile one glob, rejecting absolute and escaping ones.
fn compile(glob: &str) -> Result<Pattern, Failure> {
    if glob.starts_with('/') {
        return Err(Failure::Glob {
            message: format!("Glob \"{glob}\" must be relative to the workspace root"),
        });
    }
    let components: Vec<&str> = glob
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    if components.contains(&"..") {
        return Err(Failure::Glob {
            message: format!("Glob \"{glob}\" must not contain '..'"),
        });
    }
    Pattern::new(&components.join("/")).map_err(|e| Failure::Glob {
        message: format!("Invalid glob \"{glob}\": {e}"),
    })
}

/// `path` relative to `root` with `/` separators; `None` for the root itself
/// or a path that is not valid UTF-8.
fn relative(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, Workspace) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir_all(root.join("c/empty")).unwrap();
        fs::write(root.join("4.txt"), "four").unwrap();
        fs::write(root.join("a/3.txt"), "three").unwrap();
        fs::write(root.join("a/b/1.txt"), "one").unwrap();
        fs::write(root.join("a/b/2"), "two").unwrap();
        fs::write(root.join("c/skip.pyc"), "bytecode").unwrap();
        let workspace =
            Workspace::new(root.to_path_buf(), &["**/*.pyc".to_string()], true).unwrap();
        (tmp, workspace)
    }

    fn expand(workspace: &Workspace, globs: &[&str]) -> Paths {
        workspace.expand(&PathGlobs::new(globs.iter().copied())).unwrap()
    }

    #[test]
    fn test_literal_files_and_directories() {
        let (_tmp, ws) = workspace();
        assert_eq!(expand(&ws, &["4.txt"]).files, vec!["4.txt"]);
        let dir = expand(&ws, &["a/b"]);
        assert!(dir.files.is_empty());
        assert_eq!(dir.dirs, vec!["a/b"]);
        assert_eq!(expand(&ws, &["missing"]), Paths::default());
    }

    #[test]
    fn test_star_stays_in_one_directory() {
        let (_tmp, ws) = workspace();
        let top = expand(&ws, &["*"]);
        assert_eq!(top.files, vec!["4.txt"]);
        assert_eq!(top.dirs, vec!["a", "c"]);
        assert_eq!(expand(&ws, &["a/b/*"]).files, vec!["a/b/1.txt", "a/b/2"]);
        assert!(expand(&ws, &["*/1.txt"]).files.is_empty());
    }

    #[test]
    fn test_recursive_glob_and_excludes() {
        let (_tmp, ws) = workspace();
        assert_eq!(
            expand(&ws, &["**/*.txt"]).files,
            vec!["4.txt", "a/3.txt", "a/b/1.txt"]
        );
        assert_eq!(
            expand(&ws, &["**/*.txt", "!a/b/**"]).files,
            vec!["4.txt", "a/3.txt"]
        );
        // Workspace ignores apply to every request
        assert!(expand(&ws, &["c/*"]).files.is_empty());
    }

    #[test]
    fn test_unmatched_glob_behavior() {
        let (_tmp, ws) = workspace();
        let err = ws
            .expand(&PathGlobs::new(["nope.txt", "!ignore.txt"]).error_on_unmatched("BUILD"))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unmatched glob from BUILD: \"nope.txt\", exclude: \"ignore.txt\""
        );

        let any = PathGlobs::new(["nope.txt", "4.txt"])
            .error_on_unmatched("BUILD")
            .any_match();
        assert_eq!(ws.expand(&any).unwrap().files, vec!["4.txt"]);

        let warned = PathGlobs::new(["nope.txt"]).warn_on_unmatched("BUILD");
        assert_eq!(ws.expand(&warned).unwrap(), Paths::default());
    }

    #[test]
    fn test_escaping_globs_are_rejected() {
        let (_tmp, ws) = workspace();
        for glob in ["/etc/*", "../*", "a/../../x"] {
            assert!(matches!(
                ws.expand(&PathGlobs::new([glob])),
                Err(Failure::Glob { .. })
            ));
        }
    }

    #[test]
    fn test_gitignore_is_respected() {
        let (tmp, ws) = workspace();
        fs::write(tmp.path().join(".gitignore"), "a/3.txt\n").unwrap();
        assert!(!expand(&ws, &["a/*"]).files.contains(&"a/3.txt".to_string()));

        let raw = Workspace::new(tmp.path().to_path_buf(), &[], false).unwrap();
        assert!(expand(&raw, &["a/*"]).files.contains(&"a/3.txt".to_string()));
    }

    #[test]
    fn test_snapshot_lists_parents() {
        let (_tmp, ws) = workspace();
        let store = Store::memory();
        let snapshot = ws
            .snapshot(&store, &PathGlobs::new(["a/b/*.txt", "c/empty"]))
            .unwrap();
        assert_eq!(snapshot.files, vec!["a/b/1.txt"]);
        assert_eq!(snapshot.dirs, vec!["a", "a/b", "c", "c/empty"]);

        let empty = ws.snapshot(&store, &PathGlobs::new(["zzz"])).unwrap();
        assert_eq!(empty, Snapshot::empty());
    }

    #[test]
    fn test_affected_by() {
        let globs = PathGlobs::new(["src/**/*.rs", "!src/gen/**"]);
        assert!(affected_by(&globs, "src/lib.rs"));
        assert!(affected_by(&globs, "src/deep/mod.rs"));
        assert!(affected_by(&globs, "src"));
        assert!(!affected_by(&globs, "docs/readme.md"));

        let literal = PathGlobs::new(["a/b/1.txt"]);
        assert!(affected_by(&literal, "a/b/1.txt"));
        assert!(affected_by(&literal, "a"));
        assert!(!affected_by(&literal, "a/b/2"));

        let dir = PathGlobs::new(["a/*"]);
        assert!(affected_by(&dir, "a/new.txt"));
        assert!(affected_by(&dir, "a/b/1.txt"));
        assert!(!affected_by(&dir, "b/x"));
    }
}
