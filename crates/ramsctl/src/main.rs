//! RAMS control CLI entry point.

use anyhow::Result;
use clap::Parser;
use ramsctl::cli::{Cli, Command};
use ramsctl::client::RamsdClient;
use ramsctl::commands;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = RamsdClient::new(&cli.addr);

    match &cli.command {
        Command::Health => commands::health(&client, cli.json).await,
        Command::Srs { status, incident } => {
            commands::srs(&client, status.as_deref(), incident.as_deref(), cli.json).await
        }
        Command::Assignments { status } => {
            commands::assignments(&client, status.as_deref(), cli.json).await
        }
        Command::Teams => commands::teams(&client, cli.json).await,
    }
}
