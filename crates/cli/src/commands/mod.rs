//! Command implementations.

pub mod directory;
pub mod file;
pub mod process;
pub mod store;

use crate::cli::{CliError, Commands};
use cairn_engine::EngineConfig;
use cairn_store::{ActionCache, Store};
use std::path::PathBuf;

/// Resolved configuration shared by every command.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub config: EngineConfig,
}

impl CommandContext {
    /// Load configuration, then apply command-line overrides
    ///
    /// # Errors
    ///
    /// Returns a usage error if the configuration cannot be loaded
    pub fn load(config: Option<PathBuf>, store_dir: Option<PathBuf>) -> Result<Self, CliError> {
        let mut config = EngineConfig::load(config.as_deref())?;
        if let Some(dir) = store_dir {
            config.store.dir = Some(dir);
            config.store.memory_only = false;
        }
        Ok(Self { config })
    }

    /// Open the configured store and action cache
    ///
    /// # Errors
    ///
    /// Returns an error if no store directory can be resolved
    pub fn open_store(&self) -> Result<(Store, ActionCache), CliError> {
        if self.config.store.memory_only {
            return Err(CliError::usage_with_help(
                "The configured store is memory only",
                "Set store.dir or pass --store-dir so content outlives the command",
            ));
        }
        Ok(self.config.open_store()?)
    }
}

/// Run a parsed command
///
/// # Errors
///
/// Returns the command's error
pub async fn execute(command: Commands, ctx: &CommandContext) -> Result<(), CliError> {
    match command {
        Commands::File(cmd) => file::execute(cmd, ctx),
        Commands::Directory(cmd) => directory::execute(cmd, ctx),
        Commands::Process(cmd) => process::execute(cmd, ctx).await,
        Commands::Store(cmd) => store::execute(cmd, ctx),
    }
}
