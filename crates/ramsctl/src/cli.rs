//! Command-line interface definition.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ramsctl", about = "Control CLI for the RAMS dispatch daemon", version)]
pub struct Cli {
    /// Daemon address.
    #[arg(long, env = "RAMSD_ADDR", default_value = "127.0.0.1:7810", global = true)]
    pub addr: String,

    /// Print raw JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Daemon health and entity counts.
    Health,

    /// List service requests.
    Srs {
        /// Filter: reported, assigned, open, closed, canceled.
        #[arg(long)]
        status: Option<String>,

        /// Restrict to one incident slug.
        #[arg(long)]
        incident: Option<String>,
    },

    /// List dispatch assignments.
    Assignments {
        /// Filter: open or closed.
        #[arg(long)]
        status: Option<String>,
    },

    /// List dispatch teams with their rosters.
    Teams,
}
