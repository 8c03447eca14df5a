//! cairn command line interface
//!
//! Operator access to the content store, the action cache and the sandboxed
//! process runner. Command output goes to stdout; logs, engine events and
//! errors go to stderr.

mod cli;
mod commands;
mod logging;

use crate::cli::{CliError, EXIT_OK, exit_code_for, render_error};
use crate::commands::CommandContext;
use crate::logging::{TracingConfig, command_span, init_tracing};
use cairn_events::{EventBus, JsonRenderer};
use std::time::Duration;
use tracing::Instrument;

/// How long the event renderer may take to drain after the command ends
const EVENT_DRAIN_GRACE: Duration = Duration::from_millis(100);

fn main() {
    // NOTE: eprintln! is used here because tracing may be unusable during a panic
    #[allow(clippy::print_stderr)]
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    let cli = cli::parse();
    std::process::exit(run_with_tokio(cli));
}

fn run_with_tokio(cli: cli::Cli) -> i32 {
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            render_error(&CliError::failed(format!(
                "Failed to create tokio runtime: {e}"
            )));
            return cli::EXIT_FAILED;
        }
    };

    rt.block_on(run(cli))
}

async fn run(cli: cli::Cli) -> i32 {
    let bus = cli.json_events.then(EventBus::new);
    let renderer = bus
        .as_ref()
        .map(|bus| tokio::spawn(JsonRenderer::new().run(bus.subscribe())));

    let config = TracingConfig {
        format: cli.format,
        level: cli.level.into(),
        filter: cli.log_filter.clone(),
        ..TracingConfig::default()
    };
    let events = bus
        .as_ref()
        .and_then(EventBus::sender)
        .map(cairn_events::EventSender::into_inner);
    if let Err(e) = init_tracing(config, events) {
        render_error(&CliError::failed(e.to_string()));
        return cli::EXIT_FAILED;
    }

    let span = command_span(command_name(&cli.command));
    let result = async {
        let ctx = CommandContext::load(cli.config, cli.store_dir)?;
        commands::execute(cli.command, &ctx).await
    }
    .instrument(span)
    .await;

    if let Some(bus) = bus {
        bus.shutdown();
        if let Some(renderer) = renderer {
            let _ = tokio::time::timeout(EVENT_DRAIN_GRACE, renderer).await;
        }
    }

    match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            render_error(&err);
            exit_code_for(&err)
        }
    }
}

const fn command_name(command: &cli::Commands) -> &'static str {
    match command {
        cli::Commands::File(_) => "file",
        cli::Commands::Directory(_) => "directory",
        cli::Commands::Process(_) => "process",
        cli::Commands::Store(_) => "store",
    }
}
