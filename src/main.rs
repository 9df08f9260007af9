//! mysql-sync - Multi-Master Table Replication Daemon
//!
//! Captures row changes of configured tables via triggers and replicates
//! them to peer nodes over MQTT.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mysql_sync::bus::{BusGateway, BusNotice};
use mysql_sync::config::SyncConfig;
use mysql_sync::database::DatabaseGateway;
use mysql_sync::error::Result;
use mysql_sync::hub::EventHub;
use mysql_sync::transform::{TransformerRegistry, TransformerStage};

/// mysql-sync - Multi-Master Table Replication Daemon
#[derive(Parser)]
#[command(name = "mysql-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    std::process::exit(0)
                }
                _ => std::process::exit(-1),
            }
        }
    };

    let (hub, notices, interval) = match startup(&cli.config) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("startup error: {e}");
            std::process::exit(-2);
        }
    };

    if run(hub, notices, interval).await {
        std::process::exit(0);
    }

    // the run loop is unbounded; returning here means something is badly wrong
    tracing::error!("main loop returned");
    std::process::exit(-128);
}

fn startup(config_path: &Path) -> Result<(EventHub, mpsc::Receiver<BusNotice>, Duration)> {
    let config = SyncConfig::from_file(config_path)?;
    init_logging(&config.logging_level);
    tracing::info!(node = %config.client_name, "starting mysql-sync");

    std::fs::create_dir_all(&config.queue_directory)?;
    if let Some(dir) = &config.transformer_directory {
        std::fs::create_dir_all(dir)?;
    }

    let database = DatabaseGateway::new(&config)?;
    let (bus, notices) = BusGateway::connect(&config)?;
    let transform = TransformerStage::new(
        config.client_name.clone(),
        config.remote_clients.clone(),
        TransformerRegistry::new(),
    );

    Ok((
        EventHub::new(database, bus, transform),
        notices,
        config.check_interval(),
    ))
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// The daemon loop. Returns `true` on a graceful shutdown.
async fn run(
    mut hub: EventHub,
    mut notices: mpsc::Receiver<BusNotice>,
    check_interval: Duration,
) -> bool {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = hub.tick().await {
                    tracing::error!(error = %e, "tick failed");
                }
            }
            notice = notices.recv() => {
                match notice {
                    Some(notice) => {
                        if let Err(e) = hub.handle_notice(notice).await {
                            tracing::error!(error = %e, "dispatch failed");
                        }
                    }
                    None => return false,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                if let Err(e) = hub.shutdown().await {
                    tracing::warn!(error = %e, "bus disconnect failed");
                }
                return true;
            }
        }
    }
}
