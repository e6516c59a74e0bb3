mod bootstrap;
mod config;
mod logging;
mod probe;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "relaycast")]
#[command(about = "Relaycast media signaling server", long_about = None)]
struct Cli {
    /// Config file (YAML or TOML)
    #[arg(long, global = true)]
    config: Option<String>,

    /// HTTP listen port, overriding the config file
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling server (default)
    Serve,
    /// Negotiate a publish and a subscribe against a running server
    Probe {
        /// Signaling websocket URL
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = bootstrap::load_config(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    logging::init_logging(&config.logging)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!("Relaycast server starting...");
            info!(address = %config.http_address(), "HTTP address");
            server::serve(config).await
        }
        Command::Probe { url } => probe::run(&url).await,
    }
}
