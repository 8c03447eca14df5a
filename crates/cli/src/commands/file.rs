//! `cairn file`: single blobs.

use super::CommandContext;
use crate::cli::{CliError, FileCommands, emit, parse_digest_parts};
use std::io::{self, Write};
use tracing::{debug, instrument};

/// Run a `file` subcommand
///
/// # Errors
///
/// Returns an error if the file cannot be read, or the digest is malformed or
/// missing
pub fn execute(command: FileCommands, ctx: &CommandContext) -> Result<(), CliError> {
    let (store, _) = ctx.open_store()?;
    match command {
        FileCommands::Save { path } => save(&store, &path),
        FileCommands::Cat { digest, size } => cat(&store, &digest, size),
    }
}

#[instrument(skip(store))]
fn save(store: &cairn_store::Store, path: &std::path::Path) -> Result<(), CliError> {
    let bytes = std::fs::read(path)
        .map_err(|e| CliError::failed(format!("Failed to read {}: {e}", path.display())))?;
    let digest = store.write(bytes)?;
    debug!(%digest, "Stored file");
    emit(digest)
}

#[instrument(skip(store))]
fn cat(store: &cairn_store::Store, raw: &str, size: Option<usize>) -> Result<(), CliError> {
    let digest = parse_digest_parts(raw, size)?;
    let bytes = store.read(digest)?;
    let mut stdout = io::stdout().lock();
    stdout
        .write_all(&bytes)
        .and_then(|()| stdout.flush())
        .map_err(|e| CliError::failed(format!("Failed to write output: {e}")))
}
