//! `forge` — the admin CLI for the Forge task-execution backbone.
//!
//! A thin HTTP client over `forge-server`'s `/api/v1` surface; it holds no
//! state of its own and every subcommand is one or two round trips.

mod client;
mod commands;

use clap::Parser;
use commands::{Cli, execute};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    execute(cli).await
}
