//! `cairn store`: occupancy and garbage collection.

use super::CommandContext;
use crate::cli::{CliError, StoreCommands, emit_json};
use cairn_store::GcPolicy;
use tracing::info;

/// Run a `store` subcommand
///
/// # Errors
///
/// Returns an error if the store cannot be listed or collected, or no size
/// limit is known for `gc`
pub fn execute(command: StoreCommands, ctx: &CommandContext) -> Result<(), CliError> {
    let (store, _) = ctx.open_store()?;
    match command {
        StoreCommands::Stats => emit_json(&store.stats()?),
        StoreCommands::Gc { max_size_bytes } => {
            let max_size_bytes = max_size_bytes
                .or(ctx.config.store.max_size_bytes)
                .ok_or_else(|| {
                    CliError::usage_with_help(
                        "No size limit given for garbage collection",
                        "Pass --max-size-bytes or set store.max_size_bytes",
                    )
                })?;
            let result = store.gc(&GcPolicy::with_max_size(max_size_bytes))?;
            info!(
                blobs_removed = result.blobs_removed,
                bytes_freed = result.bytes_freed,
                "Collected store"
            );
            emit_json(&result)
        }
    }
}
