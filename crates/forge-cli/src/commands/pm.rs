//! `forge pm` — control a project's PM Orchestrator loop.

use clap::{Args, Subcommand};
use colored::Colorize;
use uuid::Uuid;

use crate::client::ForgeClient;

#[derive(Subcommand)]
pub enum PmCommands {
    /// Start (or resume) the PM loop for a project.
    Start(ProjectArgs),
    /// Pause the PM loop for a project.
    Pause(ProjectArgs),
    /// Dispatch the next ready task outside the scheduling tick.
    QueueNext(ProjectArgs),
    /// Show whether the loop is running and its current in-flight count.
    Status(ProjectArgs),
}

#[derive(Args)]
pub struct ProjectArgs {
    pub project_id: Uuid,
}

pub async fn execute(client: ForgeClient, cmd: PmCommands) -> anyhow::Result<()> {
    match cmd {
        PmCommands::Start(args) => {
            client.pm_start(args.project_id).await?;
            println!("{} PM loop started for {}", "✓".green().bold(), args.project_id);
        }
        PmCommands::Pause(args) => {
            client.pm_pause(args.project_id).await?;
            println!("{} PM loop paused for {}", "✓".green().bold(), args.project_id);
        }
        PmCommands::QueueNext(args) => {
            client.pm_queue_next(args.project_id).await?;
            println!("{} queued next ready task for {}", "✓".green().bold(), args.project_id);
        }
        PmCommands::Status(args) => {
            let status = client.pm_status(args.project_id).await?;
            match status.in_flight {
                Some(n) => println!("status: {} ({} in flight)", status.status.cyan(), n),
                None => println!("status: {}", status.status.cyan()),
            }
        }
    }
    Ok(())
}
