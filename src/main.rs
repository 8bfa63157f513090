//! h2-bridge: protocol-translating reverse proxy.
//!
//! ```text
//!     Client (HTTP/1.1 or h2)
//!         │
//!         ▼
//!   ┌─────────────┐   ┌──────────────┐   ┌────────────────────┐
//!   │ http server │──▶│ route table  │──▶│    ProxyEngine     │
//!   │ request ids │   │ (hot reload) │   │ protocol selection │
//!   └─────────────┘   └──────────────┘   └─────────┬──────────┘
//!                                                  │
//!                  ┌───────────────────────────────┼────────────────────┐
//!                  ▼                               ▼                    ▼
//!         ┌─────────────────┐           ┌──────────────────┐   ┌────────────────┐
//!         │ pool + queue    │           │ direct HTTP/1.1  │   │ WebSocket      │
//!         │ (h2 sessions)   │           │ (per request)    │   │ raw tunnel     │
//!         └─────────────────┘           └──────────────────┘   └────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use h2_bridge::config::{load_config, ProxyConfig};
use h2_bridge::lifecycle::{signals, startup, Shutdown};
use h2_bridge::observability::logging;

#[derive(Parser, Debug)]
#[command(name = "h2-bridge", version, about = "Protocol-translating reverse proxy")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "H2_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => ProxyConfig::default(),
    };

    if cli.check {
        println!("Configuration OK ({} routes)", config.routes.len());
        return ExitCode::SUCCESS;
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "h2-bridge starting");

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    match startup::run(config, cli.config.as_deref(), shutdown).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Proxy exited with error");
            ExitCode::FAILURE
        }
    }
}
