//! `cairn directory`: directory trees.

use super::CommandContext;
use crate::cli::{CliError, DirectoryCommands, emit, parse_digest};
use cairn_store::{PathEntry, Store};
use std::path::Path;
use tracing::{info, instrument};

/// Run a `directory` subcommand
///
/// # Errors
///
/// Returns an error if a digest is malformed or missing, inputs conflict, or
/// the filesystem fails
pub fn execute(command: DirectoryCommands, ctx: &CommandContext) -> Result<(), CliError> {
    let (store, _) = ctx.open_store()?;
    match command {
        DirectoryCommands::Save { path } => save(&store, &path),
        DirectoryCommands::Ls { digest } => ls(&store, &digest),
        DirectoryCommands::Materialize {
            digest,
            destination,
        } => materialize(&store, &digest, &destination),
        DirectoryCommands::Merge { digests } => merge(&store, &digests),
    }
}

#[instrument(skip(store))]
fn save(store: &Store, path: &Path) -> Result<(), CliError> {
    if !path.is_dir() {
        return Err(CliError::usage(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    let digest = store.snapshot_path(path)?;
    info!(%digest, "Snapshotted directory");
    emit(digest)
}

fn ls(store: &Store, raw: &str) -> Result<(), CliError> {
    let digest = parse_digest(raw)?;
    for entry in store.entries(digest)? {
        match entry {
            PathEntry::Directory { path } => emit(format!("{path}/"))?,
            PathEntry::File {
                path,
                digest,
                is_executable,
            } => emit(format!(
                "{path}\t{digest}{}",
                if is_executable { "\t*" } else { "" }
            ))?,
        }
    }
    Ok(())
}

#[instrument(skip(store))]
fn materialize(store: &Store, raw: &str, destination: &Path) -> Result<(), CliError> {
    let digest = parse_digest(raw)?;
    store.materialize(digest, destination)?;
    info!(%digest, destination = %destination.display(), "Materialized directory");
    Ok(())
}

fn merge(store: &Store, raw: &[String]) -> Result<(), CliError> {
    let digests = raw
        .iter()
        .map(|d| parse_digest(d))
        .collect::<Result<Vec<_>, _>>()?;
    emit(store.merge(&digests)?)
}
