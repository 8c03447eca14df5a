#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use cairn_engine::{
    Digest, DigestContents, DigestEntries, DigestEntry, EngineConfig, Failure, Params, PathGlobs,
    Paths, Rule, RuleContext, RuleSet, Scheduler, Snapshot, TypeKey,
};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn workspace_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.store.memory_only = true;
    config.workspace.root = Some(root.to_path_buf());
    config
}

fn write(root: &Path, path: &str, text: &str) {
    let path = root.join(path);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

#[derive(Debug, Clone, Serialize)]
struct Target(String);

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Sources(Vec<(String, String)>);

fn source_rules(runs: &Arc<AtomicUsize>) -> RuleSet {
    let runs = Arc::clone(runs);
    RuleSet::builder()
        .rule(
            Rule::new("sources", move |ctx: RuleContext, target: Target| {
                runs.fetch_add(1, Ordering::SeqCst);
                async move {
                    let globs = PathGlobs::new([format!("{}/**/*.txt", target.0)])
                        .error_on_unmatched(format!("target {}", target.0));
                    let snapshot: Snapshot = ctx.get(globs).await?;
                    let contents: DigestContents = ctx.get(snapshot.digest).await?;
                    Ok::<_, Failure>(Sources(
                        contents
                            .0
                            .into_iter()
                            .map(|file| (file.path, String::from_utf8_lossy(&file.content).into()))
                            .collect(),
                    ))
                }
            })
            .get::<Snapshot, PathGlobs>()
            .get::<DigestContents, Digest>(),
        )
        .query::<Sources>([TypeKey::of::<Target>()])
        .build()
}

#[tokio::test]
async fn test_rules_read_the_workspace() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/a.txt", "alpha");
    write(dir.path(), "src/nested/b.txt", "beta");
    write(dir.path(), "src/c.rs", "skipped");
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::new(source_rules(&runs), workspace_config(dir.path())).unwrap();

    let sources: Sources = scheduler
        .new_session()
        .execute(Params::of(Target("src".into())).unwrap())
        .await
        .unwrap();
    assert_eq!(
        sources,
        Sources(vec![
            ("src/a.txt".into(), "alpha".into()),
            ("src/nested/b.txt".into(), "beta".into()),
        ])
    );
}

#[tokio::test]
async fn test_unmatched_glob_fails_the_rule() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/a.txt", "alpha");
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::new(source_rules(&runs), workspace_config(dir.path())).unwrap();

    let err = scheduler
        .new_session()
        .execute::<Sources>(Params::of(Target("docs".into())).unwrap())
        .await
        .unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("target docs"), "{rendered}");
}

#[tokio::test]
async fn test_invalidate_paths_reruns_readers() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/a.txt", "alpha");
    write(dir.path(), "other/z.txt", "zeta");
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::new(source_rules(&runs), workspace_config(dir.path())).unwrap();
    let params = || Params::of(Target("src".into())).unwrap();

    let _: Sources = scheduler.new_session().execute(params()).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // A path outside every glob clears nothing
    write(dir.path(), "other/z.txt", "omega");
    let unrelated = scheduler.invalidate_paths(&["other/z.txt"]);
    assert_eq!(unrelated.cleared, 0);

    // Rewriting with identical content is cut off at the snapshot
    write(dir.path(), "src/a.txt", "alpha");
    let same = scheduler.invalidate_paths(&["src/a.txt"]);
    assert_eq!(same.cleared, 1);
    let _: Sources = scheduler.new_session().execute(params()).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // New content reaches the reader
    write(dir.path(), "src/a.txt", "changed");
    scheduler.invalidate_paths(&["src/a.txt"]);
    let sources: Sources = scheduler.new_session().execute(params()).await.unwrap();
    assert_eq!(sources, Sources(vec![("src/a.txt".into(), "changed".into())]));
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // So does a file added under a recursive glob
    write(dir.path(), "src/deep/new.txt", "fresh");
    scheduler.invalidate_paths(&["src/deep/new.txt"]);
    let sources: Sources = scheduler.new_session().execute(params()).await.unwrap();
    assert_eq!(sources.0.len(), 2);
}

#[derive(Debug, Clone, Serialize)]
struct Listing;

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Summary {
    paths: Paths,
    entries: Vec<String>,
    snapshot_files: Vec<String>,
}

async fn summarize(ctx: RuleContext, _listing: Listing) -> Result<Summary, Failure> {
    let globs = PathGlobs::new(["*.txt", "bin/*", "!skip.txt"]);
    let paths: Paths = ctx.get(globs.clone()).await?;
    let digest: Digest = ctx.get(globs).await?;
    let entries: DigestEntries = ctx.get(digest).await?;
    let snapshot: Snapshot = ctx.get(digest).await?;
    Ok(Summary {
        paths,
        entries: entries
            .0
            .iter()
            .map(|entry| match entry {
                DigestEntry::File {
                    path, is_executable, ..
                } => format!("{path}{}", if *is_executable { "*" } else { "" }),
                DigestEntry::Directory { path } => format!("{path}/"),
            })
            .collect(),
        snapshot_files: snapshot.files,
    })
}

#[tokio::test]
async fn test_paths_digests_and_entries() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "keep.txt", "k");
    write(dir.path(), "skip.txt", "s");
    write(dir.path(), "bin/tool", "#!/bin/sh\n");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(
            dir.path().join("bin/tool"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();
    }
    let rules = RuleSet::builder()
        .rule(
            Rule::new("summarize", summarize)
                .get::<Paths, PathGlobs>()
                .get::<Digest, PathGlobs>()
                .get::<DigestEntries, Digest>()
                .get::<Snapshot, Digest>(),
        )
        .query::<Summary>([TypeKey::of::<Listing>()])
        .build();
    let scheduler = Scheduler::new(rules, workspace_config(dir.path())).unwrap();

    let summary: Summary = scheduler
        .new_session()
        .execute(Params::of(Listing).unwrap())
        .await
        .unwrap();
    assert_eq!(summary.paths.files, vec!["bin/tool", "keep.txt"]);
    assert!(summary.paths.dirs.is_empty());
    assert_eq!(summary.snapshot_files, vec!["bin/tool", "keep.txt"]);
    #[cfg(unix)]
    assert_eq!(summary.entries, vec!["bin/", "bin/tool*", "keep.txt"]);
}

#[tokio::test]
async fn test_ignored_paths_never_match() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), ".git/config.txt", "hidden");
    write(dir.path(), "build/out.txt", "generated");
    write(dir.path(), "src/a.txt", "alpha");
    let mut config = workspace_config(dir.path());
    config.workspace.ignore.push("build".into());
    let rules = RuleSet::builder()
        .rule(
            Rule::new("all", |ctx: RuleContext, _listing: Listing| async move {
                ctx.get::<Paths, PathGlobs>(PathGlobs::new(["**/*.txt"])).await
            })
            .get::<Paths, PathGlobs>(),
        )
        .query::<Paths>([TypeKey::of::<Listing>()])
        .build();
    let scheduler = Scheduler::new(rules, config).unwrap();

    let paths: Paths = scheduler
        .new_session()
        .execute(Params::of(Listing).unwrap())
        .await
        .unwrap();
    assert_eq!(paths.files, vec!["src/a.txt"]);
}
