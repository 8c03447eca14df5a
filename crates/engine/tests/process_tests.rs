#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use cairn_engine::{
    CreateDigest, Digest, DigestContents, EngineConfig, Error, FallibleProcessResult, Failure,
    FileSpec, MergeDigests, Params, Process, ProcessCacheScope, ProcessResult,
    ProcessResultSource, Rule, RuleContext, RuleSet, Scheduler, TypeKey,
};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn sh(script: &str) -> Process {
    Process::new(["/bin/sh", "-c", script]).env("PATH", "/usr/bin:/bin")
}

fn memory_scheduler(rules: RuleSet) -> Scheduler {
    let mut config = EngineConfig::default();
    config.store.memory_only = true;
    Scheduler::new(rules, config).unwrap()
}

fn disk_scheduler(root: &Path) -> Scheduler {
    let mut config = EngineConfig::default();
    config.store.dir = Some(root.to_path_buf());
    Scheduler::new(RuleSet::default(), config).unwrap()
}

#[tokio::test]
async fn test_timeout_fails_the_request() {
    let scheduler = memory_scheduler(RuleSet::default());
    let err = scheduler
        .new_session()
        .run_process(sh("sleep 30").timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(
        err.failures(),
        [Failure::ProcessTimeout { timeout_ms: 200, .. }]
    ));
}

#[tokio::test]
async fn test_default_timeout_from_config() {
    let mut config = EngineConfig::default();
    config.store.memory_only = true;
    config.process.default_timeout_secs = 1;
    let scheduler = Scheduler::new(RuleSet::default(), config).unwrap();
    let err = scheduler
        .new_session()
        .run_process(sh("sleep 30"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.failures(),
        [Failure::ProcessTimeout { timeout_ms: 1000, .. }]
    ));
}

#[tokio::test]
async fn test_fallible_result_reports_exit_code() {
    let scheduler = memory_scheduler(RuleSet::default());
    let result = scheduler
        .new_session()
        .run_process(sh("echo oops >&2; exit 3"))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 3);
    assert_eq!(&scheduler.store().read(result.stderr_digest).unwrap()[..], b"oops\n");
}

#[tokio::test]
async fn test_empty_argv_is_an_error() {
    let scheduler = memory_scheduler(RuleSet::default());
    let err = scheduler
        .new_session()
        .run_process(Process::new(Vec::<String>::new()))
        .await
        .unwrap_err();
    assert!(matches!(err.failures(), [Failure::Io { .. }]));
}

#[derive(Debug, Clone, Serialize)]
struct Script(String);

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Stdout(String);

async fn run_script(ctx: RuleContext, script: Script) -> Result<Stdout, Failure> {
    let result: ProcessResult = ctx.get(sh(&script.0).description("script")).await?;
    let bytes = ctx.store().read(result.stdout_digest)?;
    Ok(Stdout(String::from_utf8_lossy(&bytes).into_owned()))
}

fn script_rules() -> RuleSet {
    RuleSet::builder()
        .rule(Rule::new("run_script", run_script).get::<ProcessResult, Process>())
        .query::<Stdout>([TypeKey::of::<Script>()])
        .build()
}

#[tokio::test]
async fn test_strict_result_fails_on_nonzero_exit() {
    let scheduler = memory_scheduler(script_rules());
    let err = scheduler
        .new_session()
        .execute::<Stdout>(Params::of(Script("echo partial; echo broken >&2; exit 2".into())).unwrap())
        .await
        .unwrap_err();
    match err.failures() {
        [Failure::ProcessExecution {
            description,
            exit_code,
            summary,
        }] => {
            assert_eq!(description, "script");
            assert_eq!(*exit_code, 2);
            assert!(summary.contains("stdout:\npartial"));
            assert!(summary.contains("stderr:\nbroken"));
        }
        other => panic!("unexpected failures: {other:?}"),
    }
}

#[tokio::test]
async fn test_strict_result_succeeds() {
    let scheduler = memory_scheduler(script_rules());
    let stdout: Stdout = scheduler
        .new_session()
        .execute(Params::of(Script("printf hello".into())).unwrap())
        .await
        .unwrap();
    assert_eq!(stdout, Stdout("hello".to_string()));
}

#[derive(Debug, Clone, Serialize)]
struct Sources(Vec<(String, String)>);

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Bundle(String);

async fn bundle(ctx: RuleContext, sources: Sources) -> Result<Bundle, Failure> {
    let files: Vec<CreateDigest> = sources
        .0
        .into_iter()
        .map(|(path, text)| CreateDigest(vec![FileSpec::new(path, text)]))
        .collect();
    let digests: Vec<Digest> = ctx.get_all(files).await?;
    let input: Digest = ctx.get(MergeDigests(digests)).await?;

    let process = sh("mkdir -p out && cat src/*.txt > out/bundle.txt")
        .input_digest(input)
        .output_directories(["out"])
        .description("bundle sources");
    let result: ProcessResult = ctx.get(process).await?;

    let contents: DigestContents = ctx.get(result.output_digest).await?;
    let file = contents
        .file("out/bundle.txt")
        .ok_or_else(|| Failure::rule("bundle", "no bundle produced"))?;
    Ok(Bundle(String::from_utf8_lossy(&file.content).into_owned()))
}

#[tokio::test]
async fn test_process_with_store_intrinsics() {
    let rules = RuleSet::builder()
        .rule(
            Rule::new("bundle", bundle)
                .get::<Digest, CreateDigest>()
                .get::<Digest, MergeDigests>()
                .get::<ProcessResult, Process>()
                .get::<DigestContents, Digest>(),
        )
        .query::<Bundle>([TypeKey::of::<Sources>()])
        .build();
    let scheduler = memory_scheduler(rules);
    let sources = Sources(vec![
        ("src/a.txt".into(), "alpha\n".into()),
        ("src/b.txt".into(), "beta\n".into()),
    ]);
    let bundle: Bundle = scheduler
        .new_session()
        .execute(Params::of(sources).unwrap())
        .await
        .unwrap();
    assert_eq!(bundle, Bundle("alpha\nbeta\n".to_string()));
}

#[tokio::test]
async fn test_results_are_memoized_within_a_scheduler() {
    let scheduler = memory_scheduler(RuleSet::default());
    let process = sh("date +%s%N");
    let first = scheduler.new_session().run_process(process.clone()).await.unwrap();
    let second = scheduler.new_session().run_process(process).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(scheduler.graph_stats().runs, 1);
}

#[tokio::test]
async fn test_results_are_cached_across_schedulers() {
    let root = TempDir::new().unwrap();
    let process = sh("echo cached > result.txt; date +%s%N").output_files(["result.txt"]);

    let first: FallibleProcessResult = disk_scheduler(root.path())
        .new_session()
        .run_process(process.clone())
        .await
        .unwrap();
    assert_eq!(first.metadata.source, ProcessResultSource::Ran);

    let scheduler = disk_scheduler(root.path());
    let second = scheduler.new_session().run_process(process).await.unwrap();
    assert_eq!(second.metadata.source, ProcessResultSource::Cached);
    assert_eq!(second.stdout_digest, first.stdout_digest);
    assert_eq!(second.output_digest, first.output_digest);

    let files = scheduler.store().contents(second.output_digest).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(&files[0].content[..], b"cached\n");
}

#[tokio::test]
async fn test_never_scope_bypasses_the_action_cache() {
    let root = TempDir::new().unwrap();
    let process = sh("echo fresh").cache_scope(ProcessCacheScope::Never);

    disk_scheduler(root.path())
        .new_session()
        .run_process(process.clone())
        .await
        .unwrap();
    let second = disk_scheduler(root.path())
        .new_session()
        .run_process(process)
        .await
        .unwrap();
    assert_eq!(second.metadata.source, ProcessResultSource::Ran);
}

#[tokio::test]
async fn test_parallel_processes_keep_order() {
    let mut config = EngineConfig::default();
    config.store.memory_only = true;
    config.process.max_parallel = 2;
    let scheduler = Scheduler::new(RuleSet::default(), config).unwrap();

    let processes: Vec<Process> = [3, 1, 2, 0]
        .iter()
        .map(|n| sh(&format!("sleep 0.0{n}; echo {n}")))
        .collect();
    let results = scheduler.new_session().run_processes(processes).await.unwrap();
    let outputs: Vec<String> = results
        .iter()
        .map(|r| String::from_utf8_lossy(&scheduler.store().read(r.stdout_digest).unwrap()).into_owned())
        .collect();
    assert_eq!(outputs, vec!["3\n", "1\n", "2\n", "0\n"]);
}

#[tokio::test]
async fn test_execution_errors_render_as_diagnostics() {
    let scheduler = memory_scheduler(RuleSet::default());
    let err = scheduler
        .new_session()
        .run_process(sh("sleep 5").timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Execution { .. }));
    assert!(err.to_string().contains("timed out after 50ms"));
}
