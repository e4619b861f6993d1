//! # ray
//!
//! Ray client binary. Wires the command engine, remote channel, and
//! webhook ingress together behind a line-based prompt.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing::{info, warn};

use ray_channel::{ChannelConfig, HttpRemoteChannel};
use ray_core::events::BatchStatus;
use ray_core::session::{ChatId, ProjectId, UserId};
use ray_core::{SessionHandle, UiEvent};
use ray_engine::{
    default_registry, CommandExecutor, FileBackupStore, OrchestratorConfig, TurnOrchestrator,
};
use ray_server::ServerConfig;
use ray_telemetry::{init_telemetry, TelemetryConfig};

/// Ray agent client.
#[derive(Parser, Debug)]
#[command(name = "ray", about = "Ray agent client")]
struct Cli {
    /// Message endpoint of the remote Ray agent.
    #[arg(long, default_value = "http://127.0.0.1:8000/api/agent/message")]
    endpoint: String,

    /// Stop endpoint override. Defaults to /api/agent/stop on the message
    /// endpoint's host.
    #[arg(long)]
    stop_endpoint: Option<String>,

    /// Port for the webhook ingress (0 for auto-assign).
    #[arg(long, default_value = "9091")]
    port: u16,

    /// Project the conversation belongs to.
    #[arg(long, default_value = "default")]
    project: String,

    /// User to attribute messages to.
    #[arg(long)]
    user: Option<String>,

    /// Workspace root the file commands operate in. Defaults to the
    /// current directory.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Model label forwarded with every turn.
    #[arg(long)]
    model: Option<String>,

    /// Halt command batches at the first failure.
    #[arg(long)]
    stop_on_error: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_telemetry(&TelemetryConfig {
        json_output: args.json_logs,
        ..TelemetryConfig::default()
    });

    info!("Starting Ray client");

    let workspace = match args.workspace {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve working directory")?,
    };

    let session = SessionHandle::new(ProjectId::from_raw(&args.project), ChatId::generate());
    if let Some(user) = &args.user {
        session.login(UserId::from_raw(user));
    }

    let executor = CommandExecutor::new(
        Arc::new(default_registry(&workspace)),
        Arc::new(FileBackupStore::new()),
    );

    let channel_config = ChannelConfig::new(&args.endpoint, args.stop_endpoint.as_deref())
        .context("Invalid agent endpoint")?;
    let channel =
        Arc::new(HttpRemoteChannel::new(channel_config).context("Failed to build HTTP client")?);
    info!(endpoint = %channel.endpoint(), "Agent channel ready");

    let (ui_tx, _) = broadcast::channel(1024);
    let mut orchestrator = TurnOrchestrator::new(
        channel,
        executor,
        session,
        ui_tx,
        OrchestratorConfig {
            stop_on_error: args.stop_on_error,
            ..OrchestratorConfig::default()
        },
    );
    if let Some(model) = args.model {
        orchestrator = orchestrator.with_model(model);
    }
    let orchestrator = Arc::new(orchestrator);
    let ui_events = orchestrator.subscribe();

    let server = ray_server::start(ServerConfig { port: args.port }, Arc::clone(&orchestrator))
        .await
        .context("Failed to start webhook server")?;
    info!(port = server.port, "Ray client ready");

    let printer = tokio::spawn(print_events(ui_events));

    run_prompt(orchestrator).await?;

    printer.abort();
    info!("Shutting down");
    Ok(())
}

/// Print UI events to stdout as they arrive.
async fn print_events(mut rx: broadcast::Receiver<UiEvent>) {
    loop {
        match rx.recv().await {
            Ok(UiEvent::RayResponse(data)) => {
                if data.is_working {
                    println!("[ray] {} (working)", data.content);
                } else if data.is_final {
                    println!("[ray] {}", data.content);
                } else {
                    println!("[ray] {} ...", data.content);
                }
            }
            Ok(UiEvent::ToolStatus(data)) => match data.status {
                BatchStatus::Starting => {
                    println!(
                        "[tools] running {}: {}",
                        data.total_count,
                        data.tools.join(", ")
                    );
                }
                BatchStatus::Working => {
                    if let Some(index) = data.current_index {
                        let name = data.tools.get(index).map(String::as_str).unwrap_or("?");
                        println!("[tools] {} ({}/{})", name, index + 1, data.total_count);
                    }
                }
                BatchStatus::Completed | BatchStatus::Partial | BatchStatus::Failed => {
                    println!(
                        "[tools] finished: {} ok, {} failed",
                        data.success_count.unwrap_or(0),
                        data.failed_count.unwrap_or(0)
                    );
                }
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Line-based prompt. `/stop` cancels the active task, `/quit` exits.
async fn run_prompt(orchestrator: Arc<TurnOrchestrator>) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    println!("Ray ready. Type a message, /stop to cancel, /quit to exit.");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                match text {
                    "/quit" | "/exit" => break,
                    "/stop" => match orchestrator.request_stop().await {
                        Ok(ack) => {
                            println!("[ray] stop acknowledged (cancelled: {})", ack.cancelled);
                        }
                        Err(e) => warn!(error = %e, "stop request failed"),
                    },
                    message => {
                        // Detached so the prompt stays responsive and
                        // /stop can land mid-exchange.
                        let orchestrator = Arc::clone(&orchestrator);
                        let message = message.to_string();
                        tokio::spawn(async move {
                            if let Err(e) = orchestrator.submit_user_message(&message).await {
                                warn!(error = %e, "message exchange failed");
                            }
                        });
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    Ok(())
}
