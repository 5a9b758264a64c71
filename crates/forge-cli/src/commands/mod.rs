//! CLI command definitions and dispatch.

pub mod admin;
pub mod board;
pub mod pm;
pub mod task;
pub mod worker;

use clap::{Parser, Subcommand};

use crate::client::ForgeClient;

/// `forge` — admin CLI for the task-execution backbone.
#[derive(Parser)]
#[command(name = "forge", version, about = "Admin CLI for the Forge task-execution backbone", propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// forge-server base URL (overrides FORGE_URL).
    #[arg(long, global = true, env = "FORGE_URL")]
    pub url: Option<String>,

    /// Admin bearer token for `forge admin token` (overrides FORGE_ADMIN_TOKEN).
    #[arg(long, global = true, env = "FORGE_ADMIN_TOKEN")]
    pub admin_token: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a worker and exchange heartbeats.
    #[command(subcommand)]
    Worker(worker::WorkerCommands),

    /// Drive a task's state transitions directly.
    #[command(subcommand)]
    Task(task::TaskCommands),

    /// Control a project's PM Orchestrator loop.
    #[command(subcommand)]
    Pm(pm::PmCommands),

    /// Inspect a project's kanban board snapshot.
    Board(board::BoardArgs),

    /// Mint worker registration tokens.
    #[command(subcommand)]
    Admin(admin::AdminCommands),
}

impl Cli {
    pub fn client(&self) -> ForgeClient {
        let mut client = match &self.url {
            Some(url) => ForgeClient::new(url.clone()),
            None => ForgeClient::from_env(),
        };
        if let Some(token) = &self.admin_token {
            client = client.with_admin_token(token.clone());
        }
        client
    }
}

pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let client = cli.client();
    match cli.command {
        Commands::Worker(cmd) => worker::execute(client, cmd).await,
        Commands::Task(cmd) => task::execute(client, cmd).await,
        Commands::Pm(cmd) => pm::execute(client, cmd).await,
        Commands::Board(args) => board::execute(client, args).await,
        Commands::Admin(cmd) => admin::execute(client, cmd).await,
    }
}
