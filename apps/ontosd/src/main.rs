use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ontos_hotel::HotelPlugin;
use ontos_kernel::{KernelBuilder, KernelConfig, OntosKernel};
use ontos_protocol::{ActionContext, SnapshotId, UserContext};
use ontos_runtime::SessionContext;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "ontosd")]
#[command(about = "ontos hotel front desk")]
struct Cli {
    /// JSON kernel configuration; defaults plus ONTOS_* overrides when absent.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "E002")]
    user: String,
    #[arg(long, default_value = "receptionist")]
    role: String,
    #[arg(long, default_value = "b1")]
    branch: String,
    /// Start with an empty property instead of the demo data.
    #[arg(long)]
    empty: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Talk to the front desk. `:undo <id>`, `:undo-all <id>`, `:audit` and
    /// `:quit` are handled locally.
    Chat,
    /// Print the exported ontology as JSON.
    Schema,
    /// Run one action and print its result.
    Dispatch {
        action: String,
        #[arg(default_value = "{}")]
        params: String,
        /// Undo the action right after it ran.
        #[arg(long)]
        undo: bool,
    },
}

impl Cli {
    fn user(&self) -> UserContext {
        UserContext::new(&self.user, &self.role).in_scope(&self.branch)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let config = KernelConfig::load(cli.config.as_deref())?;
    let plugin = if cli.empty { HotelPlugin::new() } else { HotelPlugin::new().with_demo_data() };
    let kernel = KernelBuilder::new(config).plugin(plugin).build().await?;

    match &cli.command {
        Command::Chat => chat(&kernel, cli.user()).await,
        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(&kernel.export_schema())?);
            Ok(())
        }
        Command::Dispatch { action, params, undo } => {
            let params: Value = serde_json::from_str(params).context("params must be a JSON object")?;
            let user = cli.user();
            let result = kernel.dispatch(action, params, &ActionContext::new(user.clone())).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if *undo {
                let Some(snapshot_id) = &result.snapshot_id else {
                    bail!("{action} left nothing to undo");
                };
                let outcome = kernel.undo(snapshot_id, &user).await?;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
            Ok(())
        }
    }
}

async fn chat(kernel: &OntosKernel, user: UserContext) -> Result<()> {
    let session = SessionContext::new(format!("cli-{}", user.user_id), user.clone());
    info!(session_id = %session.session_id, role = %user.role, "chat session started");

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else { break };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let reply = match text.split_once(' ').unwrap_or((text, "")) {
            (":quit" | ":q", _) => break,
            (":undo", id) => undo(kernel, &user, id, false).await,
            (":undo-all", id) => undo(kernel, &user, id, true).await,
            (":audit", _) => kernel.audit_trail(&Default::default()).await.map(|records| {
                records
                    .iter()
                    .rev()
                    .take(10)
                    .map(|r| format!("{} {} {} {}", r.recorded_at.format("%H:%M:%S"), r.actor_id, r.action, r.message))
                    .collect::<Vec<_>>()
                    .join("\n")
            }),
            _ => kernel.process_turn(text, &session).await.map(|response| {
                let mut reply = response.message;
                for result in &response.results {
                    if let Some(id) = &result.snapshot_id {
                        reply.push_str(&format!("\n  (撤销: :undo {id})"));
                    }
                }
                reply
            }),
        };
        match reply {
            Ok(reply) => println!("{reply}"),
            Err(error) => {
                warn!(%error, "command failed");
                println!("[{}] {error}", error.error_code());
            }
        }
    }
    Ok(())
}

async fn undo(
    kernel: &OntosKernel,
    user: &UserContext,
    id: &str,
    cascade: bool,
) -> Result<String, ontos_protocol::OntosError> {
    let id = SnapshotId::from(id.trim());
    let outcome = if cascade { kernel.undo_cascade(&id, user).await? } else { kernel.undo(&id, user).await? };
    Ok(format!("已撤销 {} 个操作", outcome.undone.len()))
}
