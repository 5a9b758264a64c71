//! `forge board` — a point-in-time snapshot of a project's kanban board.

use clap::Args;
use colored::Colorize;
use tabled::{Table, Tabled};
use uuid::Uuid;

use crate::client::ForgeClient;

#[derive(Args)]
pub struct BoardArgs {
    pub project_id: Uuid,
}

#[derive(Tabled)]
struct StatRow {
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "TASKS")]
    count: i64,
}

#[derive(Tabled)]
struct WorkerRow {
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "WORKERS")]
    count: i64,
}

pub async fn execute(client: ForgeClient, args: BoardArgs) -> anyhow::Result<()> {
    let board = client.board(args.project_id).await?;

    println!("{}", "tasks by status".bold());
    let mut stat_rows: Vec<StatRow> =
        board.stats.into_iter().map(|(status, count)| StatRow { status, count }).collect();
    stat_rows.sort_by(|a, b| a.status.cmp(&b.status));
    println!("{}", Table::new(stat_rows));

    println!("\n{}", "workers by liveness".bold());
    let mut worker_rows: Vec<WorkerRow> =
        board.workers.into_iter().map(|(status, count)| WorkerRow { status, count }).collect();
    worker_rows.sort_by(|a, b| a.status.cmp(&b.status));
    println!("{}", Table::new(worker_rows));

    for (column, tasks) in &board.columns {
        if tasks.is_empty() {
            continue;
        }
        println!("\n{} ({})", column.cyan().bold(), tasks.len());
        for task in tasks {
            let title = task.get("title").and_then(|v| v.as_str()).unwrap_or("<untitled>");
            let id = task.get("id").and_then(|v| v.as_str()).unwrap_or("?");
            println!("  {} {}", id.dimmed(), title);
        }
    }
    Ok(())
}
