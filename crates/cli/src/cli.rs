//! Argument parsing, error mapping and output helpers for the cairn CLI.

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use crate::logging::{LogLevel, TracingFormat};
use clap::{Args, Parser, Subcommand};
use miette::{Diagnostic, Report};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Successful exit code
pub const EXIT_OK: i32 = 0;
/// The command ran but its subject failed (process exit, conflict, I/O)
pub const EXIT_FAILED: i32 = 1;
/// Usage error, bad input or missing content
pub const EXIT_CLI: i32 = 2;

/// CLI-specific error types with exit code mapping
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum CliError {
    /// Bad arguments or configuration (exit code 2)
    #[error("{message}")]
    #[diagnostic(code(cairn::cli::usage))]
    Usage {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Requested content is not in the store (exit code 2)
    #[error("{message}")]
    #[diagnostic(code(cairn::cli::not_found))]
    NotFound {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// The operation itself failed (exit code 1)
    #[error("{message}")]
    #[diagnostic(code(cairn::cli::failed))]
    Failed {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
}

impl CliError {
    /// Create a usage error
    #[must_use]
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
            help: None,
        }
    }

    /// Create a usage error with help text
    #[must_use]
    pub fn usage_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create a failure
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            help: None,
        }
    }

    fn from_diagnostic(err: &(dyn Diagnostic + Send + Sync), not_found: bool, usage: bool) -> Self {
        let message = err.to_string();
        let help = err.help().map(|h| h.to_string());
        if not_found {
            Self::NotFound { message, help }
        } else if usage {
            Self::Usage { message, help }
        } else {
            Self::Failed { message, help }
        }
    }
}

impl From<cairn_store::Error> for CliError {
    fn from(err: cairn_store::Error) -> Self {
        let usage = matches!(
            err,
            cairn_store::Error::InvalidDigest { .. } | cairn_store::Error::InvalidPath { .. }
        );
        Self::from_diagnostic(&err, err.is_not_found(), usage)
    }
}

impl From<cairn_engine::Error> for CliError {
    fn from(err: cairn_engine::Error) -> Self {
        match err {
            cairn_engine::Error::Store(store) => store.into(),
            cairn_engine::Error::Configuration { .. } | cairn_engine::Error::Compilation(_) => {
                Self::from_diagnostic(&err, false, true)
            }
            cairn_engine::Error::Execution { .. } | cairn_engine::Error::Io { .. } => {
                Self::from_diagnostic(&err, false, false)
            }
        }
    }
}

/// Map CLI error to its exit code
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Usage { .. } | CliError::NotFound { .. } => EXIT_CLI,
        CliError::Failed { .. } => EXIT_FAILED,
    }
}

/// Render an error to stderr with miette
pub fn render_error(err: &CliError) {
    let report = Report::new(err.clone());
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "{report:?}");
    let _ = stderr.flush();
}

/// Write a line to stdout
///
/// # Errors
///
/// Returns an error if stdout is closed
pub fn emit(line: impl std::fmt::Display) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{line}").map_err(|e| CliError::failed(format!("Failed to write output: {e}")))
}

/// Write a value to stdout as pretty JSON
///
/// # Errors
///
/// Returns an error if serialization or the write fails
pub fn emit_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::failed(format!("Failed to serialize output: {e}")))?;
    emit(json)
}

/// Parse a digest argument written as `<fingerprint>-<size>`
///
/// # Errors
///
/// Returns a usage error if the digest is malformed
pub fn parse_digest(raw: &str) -> Result<cairn_store::Digest, CliError> {
    raw.parse().map_err(CliError::from)
}

/// Parse a digest given either whole or as a fingerprint and a separate size
///
/// # Errors
///
/// Returns a usage error if the digest is malformed
pub fn parse_digest_parts(raw: &str, size: Option<usize>) -> Result<cairn_store::Digest, CliError> {
    match size {
        Some(size) => cairn_store::Digest::from_parts(raw, size).map_err(CliError::from),
        None => parse_digest(raw),
    }
}

#[derive(Parser, Debug)]
#[command(name = "cairn")]
#[command(about = "Content store, action cache and sandboxed process runner")]
#[command(version)]
pub struct Cli {
    #[arg(
        short = 'l',
        long,
        global = true,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    #[arg(
        long,
        global = true,
        help = "Log output format",
        default_value = "compact",
        value_enum
    )]
    pub format: TracingFormat,

    #[arg(
        long,
        global = true,
        value_name = "DIRECTIVES",
        help = "Tracing filter directives, overriding --level and RUST_LOG"
    )]
    pub log_filter: Option<String>,

    #[arg(long, global = true, help = "Stream engine events to stderr as JSON lines")]
    pub json_events: bool,

    #[arg(long, global = true, env = "CAIRN_CONFIG", help = "Path to a cairn.toml config file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Store directory, overriding the configuration")]
    pub store_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(subcommand, about = "Store and read single files")]
    File(FileCommands),
    #[command(subcommand, about = "Snapshot, inspect and materialize directory trees")]
    Directory(DirectoryCommands),
    #[command(subcommand, about = "Run sandboxed processes")]
    Process(ProcessCommands),
    #[command(subcommand, about = "Inspect and collect the store")]
    Store(StoreCommands),
}

#[derive(Subcommand, Debug)]
pub enum FileCommands {
    #[command(about = "Store a file and print its digest")]
    Save {
        #[arg(help = "File to store")]
        path: PathBuf,
    },
    #[command(about = "Write a stored file to stdout")]
    Cat {
        #[arg(help = "Digest as <fingerprint>-<size>, or a bare fingerprint with SIZE")]
        digest: String,
        #[arg(help = "Size in bytes, when the fingerprint is given alone")]
        size: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
pub enum DirectoryCommands {
    #[command(about = "Snapshot a directory and print its digest")]
    Save {
        #[arg(help = "Directory to snapshot")]
        path: PathBuf,
    },
    #[command(about = "List the entries of a stored directory")]
    Ls {
        #[arg(help = "Directory digest")]
        digest: String,
    },
    #[command(about = "Write a stored directory to disk")]
    Materialize {
        #[arg(help = "Directory digest")]
        digest: String,
        #[arg(help = "Destination path")]
        destination: PathBuf,
    },
    #[command(about = "Merge stored directories and print the result's digest")]
    Merge {
        #[arg(required = true, help = "Directory digests")]
        digests: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProcessCommands {
    #[command(about = "Run a command in a sandbox and print its result as JSON")]
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long, help = "Digest of the input tree")]
    pub input: Option<String>,
    #[arg(long = "output-file", help = "File to capture after the run")]
    pub output_files: Vec<String>,
    #[arg(long = "output-dir", help = "Directory to capture after the run")]
    pub output_directories: Vec<String>,
    #[arg(long = "env", value_parser = parse_env_pair, help = "Environment variable as KEY=VALUE")]
    pub env: Vec<(String, String)>,
    #[arg(long, help = "Working directory relative to the sandbox root")]
    pub working_directory: Option<String>,
    #[arg(long, help = "Kill the process after this many seconds")]
    pub timeout_secs: Option<u64>,
    #[arg(long, help = "Human readable description")]
    pub description: Option<String>,
    #[arg(long, help = "Neither read nor write the action cache")]
    pub no_cache: bool,
    #[arg(last = true, required = true, help = "Command and arguments")]
    pub argv: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum StoreCommands {
    #[command(about = "Print blob counts and sizes per tier as JSON")]
    Stats,
    #[command(about = "Remove least recently used blobs until the store fits")]
    Gc {
        #[arg(long, help = "Target size in bytes; defaults to store.max_size_bytes")]
        max_size_bytes: Option<u64>,
    },
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}
