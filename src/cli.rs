//! Command-line interface.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "pg-gateway", version, about = "Layer-4 PostgreSQL primary-failover gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway (default if no subcommand is given).
    Run {
        /// Override LISTEN_HOST.
        #[arg(index = 1)]
        host: Option<String>,

        /// Override LISTEN_PORT.
        #[arg(index = 2)]
        port: Option<String>,

        /// Override NUM_THREADS.
        #[arg(long)]
        threads: Option<usize>,
    },
    /// Load and validate configuration, then exit.
    Configcheck,
}

impl Cli {
    pub fn command(self) -> Command {
        self.command.unwrap_or(Command::Run {
            host: None,
            port: None,
            threads: None,
        })
    }
}
