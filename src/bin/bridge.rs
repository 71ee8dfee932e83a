//! Output bridge worker: relay the loopback bus to one aliased device
//!
//! Exits 2 when the alias has no mapping and 3 when the mapping is
//! malformed, so the supervisor can tell configuration gaps from crashes.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use audio_router::bridge::OutputBridge;
use audio_router::bus::BusChannel;
use audio_router::config::{default_config_path, ConfigStore};
use audio_router::error::{exit_code_of, AppError};
use audio_router::registry::DeviceRegistry;
use audio_router::utils::{cancel_on_shutdown, init_logging, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "bridge")]
#[command(version, about = "Relay the audio bus to an aliased output device", long_about = None)]
struct BridgeArgs {
    /// Device alias (name of a mapping file)
    alias: String,

    /// Configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Alias mapping directory (overrides the configuration)
    #[arg(long, value_name = "DIR")]
    mapping_dir: Option<PathBuf>,

    /// Bus channel to relay (main or monitor)
    #[arg(long, default_value = "main")]
    channel: BusChannel,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = BridgeArgs::parse();
    init_logging(args.log_level, args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(exit_code_of(&e))
        }
    }
}

async fn run(args: BridgeArgs) -> anyhow::Result<()> {
    let store = ConfigStore::load(args.config.unwrap_or_else(default_config_path)).await?;
    let mut config = (*store.get()).clone();
    if let Some(dir) = args.mapping_dir {
        config.devices.mapping_dir = dir;
    }
    config.validate().map_err(AppError::Config)?;

    let registry = DeviceRegistry::new(config.devices.mapping_dir.clone());
    let cancel = CancellationToken::new();
    let bridge = OutputBridge::prepare(&args.alias, Arc::new(config), &registry)?
        .with_channel(args.channel)
        .with_cancel(cancel.clone());
    tracing::info!("Bridging bus to {} ({})", bridge.alias(), bridge.target());

    cancel_on_shutdown(cancel);
    let stats = tokio::task::spawn_blocking(move || bridge.run())
        .await
        .context("Bridge thread panicked")??;

    tracing::info!(
        "Bridge stopped: {} frames relayed, {} underruns",
        stats.frames_relayed,
        stats.underruns
    );
    Ok(())
}
