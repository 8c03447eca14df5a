//! Tracing configuration for the cairn CLI
//!
//! Diagnostics go to stderr in one of several formats. Engine events can
//! additionally be captured by a [`CairnEventLayer`] and streamed as JSON.

use cairn_events::{CairnEventLayer, EngineEvent, correlation_id};
use std::io;
pub use tracing::Level;
use tokio::sync::mpsc;
use tracing_subscriber::{
    Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Tracing output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TracingFormat {
    /// Pretty-printed human-readable format
    Pretty,
    /// Compact single-line format
    Compact,
    /// Structured JSON format
    Json,
    /// Development format with extra context
    Dev,
}

/// Log level options for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    /// Show all logs (trace level)
    Trace,
    /// Show debug and above
    Debug,
    /// Show info and above
    Info,
    /// Show warnings and above (default)
    Warn,
    /// Show errors only
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Tracing configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub format: TracingFormat,
    pub level: Level,
    pub enable_file_location: bool,
    pub filter: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            format: TracingFormat::Pretty,
            level: Level::WARN,
            enable_file_location: true,
            filter: None,
        }
    }
}

fn default_directives(level: Level) -> String {
    let level = match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    };
    format!(
        "cairn={level},cairn_engine={level},cairn_graph={level},cairn_rule_graph={level},cairn_store={level}"
    )
}

/// Initialize tracing with the given configuration
///
/// When `events` is given, engine events are also forwarded to it, whatever
/// the log level.
pub fn init_tracing(
    config: TracingConfig,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
) -> miette::Result<()> {
    let env_filter = if let Some(filter) = config.filter {
        EnvFilter::try_new(filter)
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_directives(config.level)))
    }
    .map_err(|e| miette::miette!("Failed to create tracing filter: {e}"))?;

    let fmt_layer = match config.format {
        TracingFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed(),
        TracingFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .boxed(),
        TracingFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        TracingFormat::Dev => tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_file(config.enable_file_location)
            .with_line_number(config.enable_file_location)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_level(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(events.map(CairnEventLayer::new))
        .try_init()
        .map_err(|e| miette::miette!("Failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        correlation_id = %correlation_id(),
        version = env!("CARGO_PKG_VERSION"),
        format = ?config.format,
        "Tracing initialized for cairn CLI"
    );

    Ok(())
}

/// Span for one command execution with structured fields
#[must_use]
pub fn command_span(command: &str) -> tracing::Span {
    tracing::info_span!(
        "command",
        command = %command,
        correlation_id = %correlation_id(),
        start_time = %chrono::Utc::now().to_rfc3339(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_conversion() {
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
    }

    #[test]
    fn test_default_directives_cover_engine_crates() {
        let directives = default_directives(Level::INFO);
        assert!(directives.contains("cairn_engine=info"));
        assert!(directives.contains("cairn_store=info"));
        assert!(EnvFilter::try_new(directives).is_ok());
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let config = TracingConfig {
            filter: Some("cairn_engine=loud".to_string()),
            ..TracingConfig::default()
        };
        assert!(init_tracing(config, None).is_err());
    }

    #[test]
    fn test_default_config_is_quiet() {
        let config = TracingConfig::default();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, TracingFormat::Pretty);
    }
}
