//! nearmeet: LAN chat peer.
//!
//! Runs either as the relay server peers connect to, or as a client that
//! sends stdin lines and prints the conversation. Configuration comes from
//! `config.toml`, with command-line flags taking precedence.

mod config;
mod node;

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use nearmeet_crypto::keys::Salt;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::node::{ClientNode, ServerNode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Client,
    Server,
}

#[derive(Debug, Parser)]
#[command(name = "nearmeet", version, about = "NearMeet LAN chat peer")]
struct Cli {
    /// Run as relay server or as client.
    #[arg(long, value_enum, default_value_t = Mode::Client)]
    mode: Mode,

    /// Address to bind (server) or connect to (client).
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    username: Option<String>,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,

    /// Config file; defaults to $NEARMEET_DATA_DIR/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print a fresh hex salt for `[security] salt` and exit.
    #[arg(long)]
    generate_salt: bool,
}

impl Cli {
    /// Overlay command-line values on the loaded file.
    fn apply(&self, config: &mut DaemonConfig) {
        match self.mode {
            Mode::Server => {
                if let Some(host) = &self.host {
                    config.server.host = host.clone();
                }
                if let Some(port) = self.port {
                    config.server.port = port;
                }
            }
            Mode::Client => {
                if let Some(host) = &self.host {
                    config.client.host = host.clone();
                }
                if let Some(port) = self.port {
                    config.client.port = port;
                }
            }
        }
        if let Some(username) = &self.username {
            config.client.username = username.clone();
        }
        if self.debug {
            config.log.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.generate_salt {
        println!("{}", Salt::generate().to_hex());
        return Ok(());
    }

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    // RUST_LOG, when set, replaces the configured level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("nearmeet={}", config.log.level)))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    config.validate()?;
    let key = config.session_key()?;
    if key.is_some() {
        info!("payload encryption enabled");
    }

    match cli.mode {
        Mode::Server => run_server(&config, config.server_config(key)).await,
        Mode::Client => run_client(&config, config.client_config(key)).await,
    }
}

async fn run_server(
    config: &DaemonConfig,
    server_config: nearmeet_transport::server::ServerConfig,
) -> anyhow::Result<()> {
    let node = ServerNode::start(server_config, &config.server.host, config.server.port).await?;
    info!(addr = %node.local_addr(), "NearMeet server running, Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {e}");
    }
    info!(
        peers = node.server().client_count(),
        messages = node.store().count(),
        "shutting down"
    );
    node.shutdown().await;
    Ok(())
}

async fn run_client(
    config: &DaemonConfig,
    client_config: nearmeet_transport::client::ClientConfig,
) -> anyhow::Result<()> {
    let client = &config.client;
    let node = ClientNode::connect(client_config, &client.host, client.port, &client.username).await?;
    node.print_messages();
    info!(username = %client.username, "connected, type a message and press Enter");

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = node.pump_lines(stdin) => {
            if let Err(e) = result {
                error!("input error: {e:#}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, disconnecting");
        }
    }

    node.disconnect();
    info!("disconnected");
    Ok(())
}
