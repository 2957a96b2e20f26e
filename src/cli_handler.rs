//! Client subcommands.
//!
//! Each command makes one call on the control socket of a running daemon and
//! prints the result as JSON lines on stdout.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;

use crate::cli::Commands;
use crate::config::Config;
use crate::control::{ControlClient, ServerStream};
use crate::notification::{NotifyActiveRequest, NotifyActiveResponse, NotifyRequest};

/// Run a client subcommand against the configured socket.
///
/// `Commands::Run` is handled by the caller.
pub fn handle_command(command: Commands, config: &Config) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let client = ControlClient::new(&config.supervisor.socket_path);
    rt.block_on(run_client(command, &client))
}

async fn run_client(command: Commands, client: &ControlClient) -> Result<()> {
    match command {
        Commands::Run { .. } => anyhow::bail!("`run` is not a client command"),
        Commands::Notify {
            level,
            message,
            actions,
        } => {
            let request = NotifyRequest::new(level, message).with_actions(actions);
            let response = client.notify(request).await.context("Notify failed")?;
            print_json(&response)
        }
        Commands::Respond { request_id, action } => client
            .respond(request_id, action.unwrap_or_default())
            .await
            .context("Respond failed"),
        Commands::Subscribe => {
            let stream = client.subscribe().await.context("Subscribe failed")?;
            print_stream(stream).await
        }
        Commands::SubscribeActive => {
            let stream = client
                .subscribe_active()
                .await
                .context("SubscribeActive failed")?;
            print_stream(stream).await
        }
        Commands::Open { urls, wait } => {
            let request = NotifyActiveRequest::Open {
                urls,
                await_close: wait,
            };
            let response = client
                .notify_active(request)
                .await
                .context("Open failed")?;
            print_json(&response)
        }
        Commands::Preview { url, external } => {
            let response = client
                .notify_active(NotifyActiveRequest::Preview { url, external })
                .await
                .context("Preview failed")?;
            print_json(&response)
        }
        Commands::ActiveRespond { request_id } => client
            .notify_active_respond(request_id, NotifyActiveResponse::default())
            .await
            .context("ActiveRespond failed"),
        Commands::Ports { observe } => {
            let stream = client
                .ports_status(observe)
                .await
                .context("PortsStatus failed")?;
            print_stream(stream).await
        }
    }
}

async fn print_stream<T: Serialize>(mut stream: ServerStream<T>) -> Result<()> {
    while let Some(item) = stream.next().await.context("Stream ended")? {
        print_json(&item)?;
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value).context("Failed to encode output")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line).context("Failed to write output")?;
    stdout.flush().context("Failed to write output")
}
