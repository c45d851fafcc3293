//! Cluster authentication gateway
//!
//! Exchanges cluster credentials for encrypted session tokens.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{error, info};

use cluster_auth_gateway::{
    cli::{Cli, Command, KeysCommand},
    config::Config,
    gateway::Gateway,
    keyring::KeyRing,
    setup_tracing, store,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Keys(cmd)) => match run_keys_command(cmd, config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Key command failed: {e:#}");
                ExitCode::FAILURE
            }
        },
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Run key ring maintenance commands
async fn run_keys_command(cmd: KeysCommand, config: Config) -> anyhow::Result<()> {
    let store = store::connect(&config.store).context("opening secret store")?;
    let ring = Arc::new(KeyRing::new(store, &config.store, config.keys.clone()));

    match cmd {
        KeysCommand::List { format } => {
            ring.refresh().await.context("reading key ring")?;
            let keys = ring.keys();
            if format == "json" {
                let listing: Vec<_> = keys
                    .iter()
                    .map(|k| {
                        serde_json::json!({
                            "id": k.id,
                            "algorithm": k.algorithm,
                            "created_at": k.created_at,
                            "retired_at": k.retired_at,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else if keys.is_empty() {
                println!("Key ring {} is empty", config.keys.secret_name);
            } else {
                let now = Utc::now();
                println!(
                    "{} key(s) in {}/{}:\n",
                    keys.len(),
                    config.store.namespace,
                    config.keys.secret_name
                );
                for key in &keys {
                    let state = match key.retired_at {
                        None => "active".to_string(),
                        Some(_) if key.is_expired(now, config.keys.grace_period) => {
                            "expired".to_string()
                        }
                        Some(at) => format!("retired {}", at.to_rfc3339()),
                    };
                    println!(
                        "  {}  {}  created {}  {}",
                        key.id,
                        key.algorithm,
                        key.created_at.to_rfc3339(),
                        state
                    );
                }
            }
        }

        KeysCommand::Rotate => {
            let key = ring.rotate().await.context("rotating key ring")?;
            info!(key_id = %key.id, "Key ring rotated");
            println!("Active key is now {} ({})", key.id, key.algorithm);
        }

        KeysCommand::Prune => {
            let removed = ring.prune().await.context("pruning key ring")?;
            println!("Removed {removed} expired key(s)");
        }
    }

    Ok(())
}

/// Run the gateway server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        store = ?config.store.backend,
        "Starting auth gateway"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to start gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
