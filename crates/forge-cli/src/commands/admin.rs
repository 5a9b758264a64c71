//! `forge admin` — mint worker registration tokens. The only command that
//! needs the admin bearer token (`--admin-token` / `FORGE_ADMIN_TOKEN`).

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use colored::Colorize;

use crate::client::{CreateTokenRequest, ForgeClient};

#[derive(Subcommand)]
pub enum AdminCommands {
    /// Issue a new worker registration token.
    Token(TokenArgs),
}

#[derive(Args)]
pub struct TokenArgs {
    /// Display name to attach to the token (for audit purposes).
    #[arg(long)]
    pub name: Option<String>,
    /// RFC3339 expiry timestamp; the token never expires if omitted.
    #[arg(long)]
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn execute(client: ForgeClient, cmd: AdminCommands) -> anyhow::Result<()> {
    match cmd {
        AdminCommands::Token(args) => token(client, args).await,
    }
}

async fn token(client: ForgeClient, args: TokenArgs) -> anyhow::Result<()> {
    let resp = client
        .create_token(CreateTokenRequest { display_name: args.name, expires_at: args.expires_at })
        .await?;
    println!("{} registration token minted", "✓".green().bold());
    println!("  {}", resp.token);
    Ok(())
}
