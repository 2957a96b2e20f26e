//! Command-line interface definitions for workspace-supervisor.
//!
//! Uses clap's derive API for type-safe argument parsing.

use crate::notification::NotifyLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Workspace supervisor.
///
/// `run` starts the daemon that brokers user notifications and exposes
/// loopback-only ports of the workspace. Every other command is a client of
/// a running daemon and prints JSON lines to stdout.
#[derive(Parser, Debug)]
#[command(name = "workspace-supervisor")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Command to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to additional config file.
    ///
    /// Merged on top of system and user configs.
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Control socket path, overriding the configured one.
    #[arg(long = "socket-path", value_name = "PATH", global = true)]
    pub socket_path: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the supervisor daemon.
    Run {
        /// Milliseconds between two port scans.
        #[arg(long = "poll-interval-ms", value_name = "MS")]
        poll_interval_ms: Option<u64>,
    },

    /// Show a notification and wait for the user's answer.
    Notify {
        /// Severity: error, warning or info.
        #[arg(long, default_value = "info")]
        level: NotifyLevel,

        /// Message text.
        #[arg(long)]
        message: String,

        /// Permitted answer (repeatable). Without any, returns immediately.
        #[arg(long = "action", value_name = "ACTION")]
        actions: Vec<String>,
    },

    /// Answer a pending notification.
    Respond {
        /// Notification id.
        request_id: u64,

        /// Chosen action. Omit to dismiss.
        action: Option<String>,
    },

    /// Stream notifications, pending ones first.
    Subscribe,

    /// Become the active client and stream its commands.
    SubscribeActive,

    /// Ask the active client to open files or URLs.
    Open {
        /// What to open.
        #[arg(required = true)]
        urls: Vec<String>,

        /// Wait until everything has been closed again.
        #[arg(long)]
        wait: bool,
    },

    /// Ask the active client to preview a URL.
    Preview {
        /// URL to preview.
        url: String,

        /// Open in a browser tab instead of the editor.
        #[arg(long)]
        external: bool,
    },

    /// Report completion of an active command.
    ActiveRespond {
        /// Command id.
        request_id: u64,
    },

    /// Print port status.
    Ports {
        /// Keep printing on every change.
        #[arg(long)]
        observe: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from(["workspace-supervisor", "run"]);
        assert_eq!(
            cli.command,
            Commands::Run {
                poll_interval_ms: None
            }
        );
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_parse_global_options_after_command() {
        let cli = Cli::parse_from([
            "workspace-supervisor",
            "run",
            "--poll-interval-ms",
            "500",
            "--socket-path",
            "/tmp/ws.sock",
            "-vv",
        ]);

        assert_eq!(
            cli.command,
            Commands::Run {
                poll_interval_ms: Some(500)
            }
        );
        assert_eq!(cli.socket_path, Some(PathBuf::from("/tmp/ws.sock")));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_cli_parse_notify() {
        let cli = Cli::parse_from([
            "workspace-supervisor",
            "notify",
            "--level",
            "warning",
            "--message",
            "Port 3000 is in use",
            "--action",
            "retry",
            "--action",
            "ignore",
        ]);

        match cli.command {
            Commands::Notify {
                level,
                message,
                actions,
            } => {
                assert_eq!(level, NotifyLevel::Warning);
                assert_eq!(message, "Port 3000 is in use");
                assert_eq!(actions, vec!["retry", "ignore"]);
            }
            other => panic!("Expected Notify, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parse_respond_without_action() {
        let cli = Cli::parse_from(["workspace-supervisor", "respond", "7"]);
        assert_eq!(
            cli.command,
            Commands::Respond {
                request_id: 7,
                action: None
            }
        );
    }

    #[test]
    fn test_cli_parse_open_requires_url() {
        assert!(Cli::try_parse_from(["workspace-supervisor", "open"]).is_err());

        let cli = Cli::parse_from(["workspace-supervisor", "open", "README.md", "--wait"]);
        assert_eq!(
            cli.command,
            Commands::Open {
                urls: vec!["README.md".to_string()],
                wait: true
            }
        );
    }

    #[test]
    fn test_cli_rejects_unknown_level() {
        let result = Cli::try_parse_from([
            "workspace-supervisor",
            "notify",
            "--level",
            "loud",
            "--message",
            "x",
        ]);
        assert!(result.is_err());
    }
}
