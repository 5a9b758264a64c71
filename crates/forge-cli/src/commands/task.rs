//! `forge task` — drive a task's state transitions directly, bypassing
//! the PM/Dispatcher/worker round trip. Mostly for operator intervention
//! (e.g. manually rejecting a stuck task, or retrying after a fix).

use clap::{Args, Subcommand};
use colored::Colorize;
use uuid::Uuid;

use crate::client::{ForgeClient, TransitionRequest};

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Propose a transition for a task.
    Transition(TransitionArgs),
}

#[derive(Args)]
pub struct TransitionArgs {
    pub task_id: Uuid,
    /// Target status (waiting, ready, queued, in_progress, review, done,
    /// rejected, blocked).
    pub new_status: String,
    /// Expected current version (optimistic concurrency — required).
    #[arg(long)]
    pub expected_version: i64,
    /// Who is performing the transition: "user", "pm", "system", or
    /// "worker:<uuid>". Defaults to "user" since this is an operator tool.
    #[arg(long, default_value = "user")]
    pub actor: String,
    /// Optional free-text reason, recorded on the TransitionRecord.
    #[arg(long)]
    pub reason: Option<String>,
}

pub async fn execute(client: ForgeClient, cmd: TaskCommands) -> anyhow::Result<()> {
    match cmd {
        TaskCommands::Transition(args) => transition(client, args).await,
    }
}

fn parse_actor(raw: &str) -> anyhow::Result<serde_json::Value> {
    Ok(match raw {
        "user" => serde_json::json!("user"),
        "pm" => serde_json::json!("pm"),
        "system" => serde_json::json!("system"),
        other => match other.strip_prefix("worker:") {
            Some(id) => {
                let worker_id: Uuid = id.parse()?;
                serde_json::json!({ "worker": worker_id })
            }
            None => anyhow::bail!("--actor must be user, pm, system, or worker:<uuid>"),
        },
    })
}

async fn transition(client: ForgeClient, args: TransitionArgs) -> anyhow::Result<()> {
    let actor = parse_actor(&args.actor)?;
    let resp = client
        .transition_task(
            args.task_id,
            TransitionRequest {
                new_status: args.new_status,
                actor,
                expected_version: args.expected_version,
                reason: args.reason,
            },
        )
        .await?;

    println!(
        "{} {} {} -> {} (version {})",
        "✓".green().bold(),
        resp.task_id,
        resp.previous_status.dimmed(),
        resp.status.cyan().bold(),
        resp.version
    );
    Ok(())
}
