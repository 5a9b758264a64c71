//! `forge worker` — register a worker and exchange heartbeats from the
//! terminal, mostly useful for exercising the registration flow by hand.

use clap::{Args, Subcommand};
use colored::Colorize;
use uuid::Uuid;

use crate::client::{ForgeClient, RegisterRequest};

#[derive(Subcommand)]
pub enum WorkerCommands {
    /// Register a new worker with a registration token.
    Register(RegisterArgs),
    /// Send one heartbeat for a previously-registered worker.
    Heartbeat(HeartbeatArgs),
}

#[derive(Args)]
pub struct RegisterArgs {
    /// Registration token minted via `forge admin token`.
    pub token: String,
    /// Display name for the worker.
    #[arg(long, default_value = "cli-worker")]
    pub name: String,
    /// Platform string (e.g. "linux/x86_64").
    #[arg(long, default_value = "unknown")]
    pub platform: String,
    /// Executor type (e.g. "docker", "local", "firecracker").
    #[arg(long, default_value = "local")]
    pub executor: String,
    /// Capabilities, as a JSON object or array of capability strings.
    #[arg(long, default_value = "[]")]
    pub capabilities: String,
}

#[derive(Args)]
pub struct HeartbeatArgs {
    pub worker_id: Uuid,
    pub worker_secret: String,
}

pub async fn execute(client: ForgeClient, cmd: WorkerCommands) -> anyhow::Result<()> {
    match cmd {
        WorkerCommands::Register(args) => register(client, args).await,
        WorkerCommands::Heartbeat(args) => heartbeat(client, args).await,
    }
}

async fn register(client: ForgeClient, args: RegisterArgs) -> anyhow::Result<()> {
    let capabilities = serde_json::from_str(&args.capabilities)
        .map_err(|e| anyhow::anyhow!("--capabilities must be valid JSON: {e}"))?;

    let resp = client
        .register_worker(RegisterRequest {
            token: args.token,
            display_name: args.name,
            platform: args.platform,
            executor: args.executor,
            capabilities,
        })
        .await?;

    println!("{} worker registered", "✓".green().bold());
    println!("  worker_id:     {}", resp.worker_id);
    println!("  worker_secret: {}", resp.worker_secret);
    println!();
    println!("  {} save the secret — it is not recoverable from the server.", "note:".dimmed());
    Ok(())
}

async fn heartbeat(client: ForgeClient, args: HeartbeatArgs) -> anyhow::Result<()> {
    let resp = client.heartbeat(args.worker_id, &args.worker_secret).await?;
    println!("status:          {}", resp.status);
    println!("pending_tasks:   {}", resp.pending_tasks);
    if let Some(task_id) = resp.current_task_id {
        println!("current_task_id: {task_id}");
    }
    if resp.directive == "drain" {
        println!("{}", "directive: drain — finish up and exit".yellow().bold());
    }
    Ok(())
}
