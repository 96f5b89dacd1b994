//! Teehee Daemon
//!
//! Standalone WebSocket server in front of the streaming conductor.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the configured address (default 127.0.0.1:8765)
//! teehee-daemon
//!
//! # Custom address and config file
//! teehee-daemon --listen 0.0.0.0:9000 --config ./conductor.toml
//!
//! # With verbose logging
//! RUST_LOG=debug teehee-daemon
//! ```
//!
//! Clients connect to `ws://<addr>/?user=<id>`; the `user` parameter is
//! expected to be set by an authenticating proxy.
//!
//! # Environment Variables
//!
//! - `TEEHEE_LISTEN_ADDR`: Listen address
//! - `TEEHEE_CONFIG`: Config file path
//! - `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, `MISTRAL_API_KEY`: Provider keys
//! - `RUST_LOG`: Log filter (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (live streams are aborted)

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use teehee_core::{
    default_config_path, load_config_from_path, Conductor, ConfigSource, EngineConfig,
    EnvCredentials, HttpProviderFactory, InMemoryStore,
};

use crate::server::DaemonServer;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "teehee-daemon", version, about = "Streaming conductor WebSocket daemon")]
struct Args {
    /// Address to listen on (overrides config file)
    #[arg(long, env = "TEEHEE_LISTEN_ADDR")]
    listen: Option<String>,

    /// Path to the TOML config file
    #[arg(long, env = "TEEHEE_CONFIG")]
    config: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Merge the config file, environment, and CLI flags
fn resolve_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    if let Some(listen) = &args.listen {
        config.server.listen_addr.clone_from(listen);
        config.set_source(ConfigSource::Cli);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "teehee_daemon={0},teehee_core={0}",
                    args.log_level
                ))
            }),
        )
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting teehee daemon");

    let config = resolve_config(&args)?;
    info!(
        source = %config.source(),
        listen = %config.server.listen_addr,
        "Configuration loaded"
    );

    let credentials = EnvCredentials::from_env();
    let configured = credentials.configured();
    if configured.is_empty() {
        warn!("No provider API keys found; every submit will fail with missing_credentials");
    } else {
        info!(providers = ?configured, "Provider credentials available");
    }

    let conductor = Conductor::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(credentials),
        Arc::new(HttpProviderFactory::new(config.providers.clone())),
        config.clone(),
    );

    let server = DaemonServer::new(conductor, config.server.clone());
    let listener = server.bind().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("Received Ctrl+C, shutting down"),
            () = terminate => info!("Received SIGTERM, shutting down"),
        }

        let _ = shutdown_tx.send(true);
    });

    server.serve(listener, shutdown_rx).await?;
    info!("Teehee daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn args(listen: Option<&str>, config: Option<PathBuf>) -> Args {
        Args {
            listen: listen.map(str::to_string),
            config,
            log_level: "info".into(),
        }
    }

    #[test]
    fn test_cli_listen_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nlisten_addr = \"127.0.0.1:9100\"").unwrap();

        let from_file = resolve_config(&args(None, Some(file.path().to_path_buf()))).unwrap();
        if std::env::var("TEEHEE_LISTEN_ADDR").is_err() {
            assert_eq!(from_file.server.listen_addr, "127.0.0.1:9100");
        }

        let from_cli =
            resolve_config(&args(Some("127.0.0.1:9200"), Some(file.path().to_path_buf()))).unwrap();
        assert_eq!(from_cli.server.listen_addr, "127.0.0.1:9200");
        assert_eq!(from_cli.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_invalid_config_file_is_reported() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is not toml [").unwrap();
        assert!(resolve_config(&args(None, Some(file.path().to_path_buf()))).is_err());
    }
}
