//! uns-graph-sync CLI
//!
//! Mirrors an MQTT Unified Namespace into a SQLite graph store.
//!
//! ## Commands
//!
//! - `run [--config <file>]`: Run the sync service until Ctrl-C or a fatal error
//! - `check-config <file>`: Validate a configuration file and print the effective settings
//!
//! ## Exit Codes
//!
//! - `0`: clean shutdown
//! - `2`: the broker or the store rejected the configured credentials
//! - `3`: the configuration is invalid
//! - `1`: any other error

use clap::{Parser, Subcommand};
mod health_server;
use std::path::PathBuf;
use uns_graph_sync::{config::SyncConfig, service::SyncService, SyncError};

#[derive(Parser)]
#[command(name = "uns-graph-sync")]
#[command(author, version, about = "Mirror an MQTT Unified Namespace into a graph store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync service until Ctrl-C or a fatal error
    Run {
        /// Configuration file path (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Configuration file path
        path: PathBuf,
    },
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config } => run(config),
        Commands::CheckConfig { path } => check_config(path),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}

fn load_config(path: Option<PathBuf>) -> Result<SyncConfig, SyncError> {
    match path {
        Some(path) => SyncConfig::load(path),
        None => {
            let mut config = SyncConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

fn check_config(path: PathBuf) -> Result<(), SyncError> {
    let config = SyncConfig::load(&path)?;
    println!("{}", config.redacted().to_toml_string()?);
    println!("Configuration {} is valid", path.display());
    Ok(())
}

fn run(config_path: Option<PathBuf>) -> Result<(), SyncError> {
    let config = load_config(config_path)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut service = SyncService::open(config.clone()).await?;
        let shutdown = service.shutdown_handle();

        // Set up Ctrl-C handler
        let ctrlc_shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            println!("\nShutting down...");
            ctrlc_shutdown.trigger();
        })
        .map_err(|e| SyncError::Config(format!("cannot install Ctrl-C handler: {e}")))?;

        service.start().await?;

        let server_handle = if config.health.enabled {
            let server = health_server::HealthServer::new(config.health_addr()?, service.health());
            let server_shutdown = shutdown.clone();
            Some(tokio::spawn(
                server.serve(async move { server_shutdown.wait().await }),
            ))
        } else {
            None
        };

        println!(
            "Mirroring {:?} from {}:{} into {}. Press Ctrl-C to stop.",
            config.transport.topics, config.transport.host, config.transport.port, config.store.path
        );

        // Keep running until Ctrl-C or a fatal error
        let outcome = service.wait().await;

        // Cleanup
        service.shutdown().await?;
        if let Some(handle) = server_handle {
            match handle.await {
                Ok(Err(e)) => tracing::warn!("Health endpoint error: {e}"),
                Err(e) => tracing::warn!("Health endpoint task failed: {e}"),
                Ok(Ok(())) => {}
            }
        }

        println!("Shutdown complete");
        outcome
    })
}
