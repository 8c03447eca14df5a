//! `cairn process run`: one sandboxed process through the engine.

use super::CommandContext;
use crate::cli::{CliError, ProcessCommands, RunArgs, emit_json, parse_digest};
use cairn_engine::{
    FallibleProcessResult, Process, ProcessCacheScope, ProcessResultSource, RuleSet, Scheduler,
};
use cairn_store::Store;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument};

/// What `process run` prints.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub exit_code: i32,
    pub stdout_digest: String,
    pub stderr_digest: String,
    pub output_digest: String,
    pub source: ProcessResultSource,
    pub elapsed_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

impl RunReport {
    fn new(result: &FallibleProcessResult, store: &Store) -> Result<Self, CliError> {
        let stdout = store.read(result.stdout_digest)?;
        let stderr = store.read(result.stderr_digest)?;
        Ok(Self {
            exit_code: result.exit_code,
            stdout_digest: result.stdout_digest.to_string(),
            stderr_digest: result.stderr_digest.to_string(),
            output_digest: result.output_digest.to_string(),
            source: result.metadata.source,
            elapsed_ms: result.metadata.elapsed_ms,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// Run a `process` subcommand
///
/// # Errors
///
/// Returns an error if the process cannot be run, times out, or exits non-zero
pub async fn execute(command: ProcessCommands, ctx: &CommandContext) -> Result<(), CliError> {
    match command {
        ProcessCommands::Run(args) => run(args, ctx).await,
    }
}

/// Build the process request from command-line arguments
///
/// # Errors
///
/// Returns a usage error if the input digest is malformed
pub fn build_process(args: RunArgs) -> Result<Process, CliError> {
    let mut process = Process::new(args.argv)
        .output_files(args.output_files)
        .output_directories(args.output_directories);
    for (key, value) in args.env {
        process = process.env(key, value);
    }
    if let Some(input) = args.input {
        process = process.input_digest(parse_digest(&input)?);
    }
    if let Some(dir) = args.working_directory {
        process = process.working_directory(dir);
    }
    if let Some(secs) = args.timeout_secs {
        process = process.timeout(Duration::from_secs(secs));
    }
    if let Some(description) = args.description {
        process = process.description(description);
    }
    if args.no_cache {
        process = process.cache_scope(ProcessCacheScope::Never);
    }
    Ok(process)
}

#[instrument(skip_all, fields(argv = ?args.argv))]
async fn run(args: RunArgs, ctx: &CommandContext) -> Result<(), CliError> {
    let process = build_process(args)?;
    let description = process.description.clone();

    let (store, action_cache) = ctx.open_store()?;
    let scheduler = Scheduler::with_store(
        RuleSet::builder().build(),
        ctx.config.clone(),
        store,
        action_cache,
    )?;
    let result = scheduler.new_session().run_process(process).await?;
    info!(
        exit_code = result.exit_code,
        source = ?result.metadata.source,
        "Process finished"
    );

    emit_json(&RunReport::new(&result, scheduler.store())?)?;
    if result.exit_code == 0 {
        Ok(())
    } else {
        Err(CliError::failed(format!(
            "Process '{description}' exited with code {}",
            result.exit_code
        )))
    }
}
