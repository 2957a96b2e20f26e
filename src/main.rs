//! workspace-supervisor: notification broker and port reconciler for a
//! development workspace.
//!
//! `run` starts the daemon in the foreground. All other subcommands talk to a
//! running daemon over its control socket.
//!
//! Debug logging goes to stderr through `tracing`; client output goes to
//! stdout as JSON lines; audit events go to syslog.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use workspace_supervisor::{
    cli::{Cli, Commands},
    cli_handler,
    config::ConfigLoader,
    supervisor,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, &config.supervisor.log_level)?;
    debug!("Parsed CLI arguments: {:?}", cli);
    debug!("Loaded configuration: {:?}", config);

    match cli.command {
        Commands::Run { .. } => supervisor::run_supervisor(config),
        command => cli_handler::handle_command(command, &config),
    }
}

/// Initialize the tracing subscriber for debug logging on stderr.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else the configured level, else warnings
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, configured: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let fallback = if configured.is_empty() { "warn" } else { configured };
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
