//! quic-tunnel: HTTP proxy client and tunnel server
//!
//! `quic-tunnel server` terminates the QUIC tunnel and relays to real
//! destinations. `quic-tunnel client` runs the local HTTP proxy that feeds it.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "quic-tunnel")]
#[command(about = "Tunnel TCP and UDP traffic over a single QUIC connection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the local HTTP proxy
    Client {
        /// Client config file
        #[arg(short, long, default_value = "config/client.json")]
        config: PathBuf,
    },
    /// Run the tunnel server
    Server {
        /// Server config file
        #[arg(short, long, default_value = "config/server.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Client { config } => cli::client::run(&config).await,
        Commands::Server { config } => cli::server::run(&config).await,
    }
}
