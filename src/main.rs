//! CLI entry point for the LeCroy device server.
//!
//! # Usage
//!
//! Serve a scope on the network:
//! ```bash
//! lecroy_daq -r TCPIP::192.168.1.100::INSTR -c 4 -v
//! ```
//!
//! Run against the built-in simulated scope:
//! ```bash
//! lecroy_daq --mock -c 2 -vv
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use figment::providers::Serialized;
use lecroy_daq::config::ServerConfig;
use lecroy_daq::instrument::mock::MockScope;
use lecroy_daq::instrument::tcp::{SocketResource, TcpTransport};
use lecroy_daq::instrument::InstrumentSession;
use lecroy_daq::logging::{self, TracingConfig};
use lecroy_daq::pv::definitions::declarations;
use lecroy_daq::pv::registry::{LocalRegistry, PvRegistry, ServerState};
use lecroy_daq::server::DeviceServer;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Serialize)]
#[command(name = "lecroy_daq")]
#[command(about = "PV device server for LeCroy oscilloscopes", long_about = None)]
struct Cli {
    /// Number of channels per device
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    channels: Option<u8>,

    /// Device name, the PV prefix will be <device><index>:
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<String>,

    /// Device index, the PV prefix will be <device><index>:
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<String>,

    /// Resource string, e.g. TCPIP::192.168.1.100::1861::SOCKET
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    resource: Option<String>,

    /// Show more log messages (-vv: show even more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    #[serde(skip)]
    verbose: u8,

    /// Optional TOML configuration file
    #[arg(long)]
    #[serde(skip)]
    config: Option<PathBuf>,

    /// Serve the built-in simulated scope instead of a real instrument
    #[arg(long)]
    #[serde(skip)]
    mock: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let figment = match &cli.config {
        Some(path) => ServerConfig::figment_with_file(path),
        None => ServerConfig::figment(),
    };
    let mut config: ServerConfig = figment
        .merge(Serialized::defaults(&cli))
        .extract()
        .context("failed to load configuration")?;
    config.verbosity = config.verbosity.max(cli.verbose);
    config.validate()?;

    logging::init(
        TracingConfig::from_verbosity(config.verbosity)
            .with_format(config.log_format)
            .with_file_and_line(config.verbosity >= 2),
    )
    .map_err(anyhow::Error::msg)?;

    let prefix = config.prefix();
    info!(%prefix, resource = %config.resource, channels = config.channels, "Configuration loaded");

    let session = if cli.mock {
        info!("Using simulated oscilloscope");
        InstrumentSession::new(&config.resource, MockScope::lecroy(config.channels))
    } else {
        let resource = SocketResource::parse(&config.resource, config.socket_port)?;
        let transport = TcpTransport::connect(&resource, config.timeout()).await?;
        InstrumentSession::new(&config.resource, transport)
    };
    session.lock().await.set_timeout(config.timeout());

    let decls = declarations(config.channels, &config.resource);
    let (registry, puts) = LocalRegistry::new(prefix.clone(), decls.clone(), config.periodic_interval());
    let registry = Arc::new(registry);

    let mut server = DeviceServer::new(Arc::new(session), registry.clone(), &decls, &config);
    server.startup(config.cycle_sleep()).await?;
    info!(%prefix, sleep = ?config.cycle_sleep(), "Server started");

    let exit_registry = registry.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, exiting");
            exit_registry.request_server_state(ServerState::Exit);
        }
    });

    server.run(puts).await?;
    Ok(())
}
