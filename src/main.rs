use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use audio_router::bridge::ingest::run_ingest;
use audio_router::bridge::{AlsaOpener, BluetoothBridge, BtRole, PeerCoordinator};
use audio_router::bus::LoopbackBus;
use audio_router::config::{default_config_path, render_config, AppConfig, ConfigStore};
use audio_router::error::{exit_code_of, AppError};
use audio_router::events::EventBus;
use audio_router::pairing::{AutoAcceptAgent, PairingAgent};
use audio_router::registry::{
    ensure_audio_hardware, select_default_device, DeviceRegistry, MacAddress, PcmTarget,
};
use audio_router::supervisor::{build_units, HealthSupervisor};
use audio_router::utils::{cancel_on_shutdown, init_logging, shutdown_signal, InstanceLock, LogLevel};

/// How often auto peer mode looks for a connected audio device
#[cfg(feature = "bluez")]
const PEER_POLL: std::time::Duration = std::time::Duration::from_secs(3);

/// audio-router command line arguments
#[derive(Parser, Debug)]
#[command(name = "audio-router")]
#[command(version, about = "PCM router over an ALSA loopback bus", long_about = None)]
struct CliArgs {
    /// Configuration file (default: $AUDIO_ROUTER_CONFIG or /etc/audio-router/router.conf)
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor, pairing agent and peer coordinator (default)
    Run,
    /// Accept a network PCM stream and write it to the bus
    Ingest,
    /// Bridge a Bluetooth peer and the bus
    BtSource {
        /// Peer address (default: per peer_mode, auto picks a connected audio device)
        address: Option<MacAddress>,

        /// sink: the peer plays into the bus; source: the bus plays to the peer
        #[arg(long, default_value = "sink")]
        role: BtRole,
    },
    /// Validate the configuration and alias mappings, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    let config_path = args.config.unwrap_or_else(default_config_path);
    let command = args.command.unwrap_or(Command::Run);

    let result = match command {
        Command::Run => run_daemon(&config_path).await,
        Command::Ingest => run_ingest_worker(&config_path).await,
        Command::BtSource { address, role } => run_bt_worker(&config_path, address, role).await,
        Command::CheckConfig => check_config(&config_path).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(exit_code_of(&e))
        }
    }
}

async fn load_config(path: &Path) -> anyhow::Result<ConfigStore> {
    let store = ConfigStore::load(path).await?;
    store.get().validate().map_err(AppError::Config)?;
    Ok(store)
}

async fn run_daemon(config_path: &Path) -> anyhow::Result<()> {
    tracing::info!("Starting audio-router v{}", env!("CARGO_PKG_VERSION"));

    let store = load_config(config_path).await?;
    let config = store.get();

    let _lock = InstanceLock::acquire(&config.devices.lock_file)?;
    LoopbackBus::new(config.bus.card.clone()).probe()?;

    let hardware = ensure_audio_hardware()?;
    let hint = config
        .devices
        .default_device
        .as_deref()
        .and_then(|s| s.parse::<PcmTarget>().ok());
    match select_default_device(&hardware, hint.as_ref()) {
        Some(device) => tracing::info!(
            "Default playback device: {} ({})",
            device.target(),
            device.description
        ),
        None => tracing::warn!("No playback device can run the bus format"),
    }

    let events = Arc::new(EventBus::new());
    let cancel = CancellationToken::new();
    let (command_tx, command_rx) = mpsc::channel(16);

    let program = std::env::current_exe().context("Failed to locate own executable")?;
    let units = build_units(&config, store.path(), &program);
    tracing::info!("Supervising {} unit(s)", units.len());

    let supervisor = HealthSupervisor::new(store.clone(), units, events.clone());
    let coordinator = PeerCoordinator::new(store.clone(), events.clone(), command_tx);
    let agent: Arc<dyn PairingAgent> = Arc::new(AutoAcceptAgent::new(events.clone()));

    #[cfg(feature = "bluez")]
    let registration = match audio_router::pairing::AgentRegistration::register(agent.clone()).await
    {
        Ok(registration) => Some(registration),
        Err(e) => {
            tracing::warn!("Pairing agent not registered: {}", e);
            None
        }
    };
    #[cfg(not(feature = "bluez"))]
    {
        tracing::error!(
            "Built without the bluez feature: no pairing agent, new Bluetooth peers will not be \
             picked up and the Bluetooth worker needs an explicit peer"
        );
        drop(agent);
    }

    let coordinator_task = tokio::spawn(coordinator.run(cancel.clone()));
    let supervisor_task = tokio::spawn(supervisor.run(command_rx, cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();

    #[cfg(feature = "bluez")]
    if let Some(registration) = registration {
        registration.unregister().await;
    }

    let (supervisor_result, coordinator_result) = tokio::join!(supervisor_task, coordinator_task);
    if let Err(e) = supervisor_result {
        tracing::error!("Supervisor task failed: {}", e);
    }
    if let Err(e) = coordinator_result {
        tracing::error!("Coordinator task failed: {}", e);
    }

    tracing::info!("audio-router stopped");
    Ok(())
}

async fn run_ingest_worker(config_path: &Path) -> anyhow::Result<()> {
    let store = load_config(config_path).await?;
    let config = store.get();
    LoopbackBus::new(config.bus.card.clone()).probe()?;

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    run_ingest(config, Arc::new(AlsaOpener), cancel)
        .await
        .context("Ingest worker failed")?;
    Ok(())
}

async fn run_bt_worker(
    config_path: &Path,
    address: Option<MacAddress>,
    role: BtRole,
) -> anyhow::Result<()> {
    let store = load_config(config_path).await?;
    let config = store.get();
    LoopbackBus::new(config.bus.card.clone()).probe()?;

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    let Some(address) = choose_bt_peer(&store, address, &cancel).await? else {
        tracing::info!("Stopped while waiting for a Bluetooth peer");
        return Ok(());
    };
    if store.get().devices.peer_address != Some(address) {
        if let Err(e) = store.set_value("peer_address", &address.to_string()).await {
            tracing::warn!("Failed to record peer {}: {}", address, e);
        }
    }

    let bridge = BluetoothBridge::new(address, role, config, cancel);
    tokio::task::spawn_blocking(move || bridge.run())
        .await
        .context("Bluetooth bridge thread panicked")?
        .with_context(|| format!("Bluetooth bridge for {} failed", address))?;
    Ok(())
}

/// Wait for bluetoothd, then pick the peer per `peer_mode`
#[cfg(feature = "bluez")]
async fn choose_bt_peer(
    store: &ConfigStore,
    explicit: Option<MacAddress>,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<MacAddress>> {
    let config = store.get();
    let directory = audio_router::pairing::BluezDirectory::new();
    let peer = audio_router::pairing::resolve_peer(
        &directory,
        config.devices.peer_mode,
        explicit,
        config.devices.peer_address,
        config.devices.bt_ready_timeout(),
        PEER_POLL,
        cancel,
    )
    .await?;
    Ok(peer)
}

#[cfg(not(feature = "bluez"))]
async fn choose_bt_peer(
    store: &ConfigStore,
    explicit: Option<MacAddress>,
    _cancel: &CancellationToken,
) -> anyhow::Result<Option<MacAddress>> {
    let peer = explicit.or(store.get().devices.peer_address).ok_or_else(|| {
        AppError::Config(
            "no Bluetooth peer: pass an address or set peer_address (built without bluez)"
                .to_string(),
        )
    })?;
    Ok(Some(peer))
}

async fn check_config(config_path: &Path) -> anyhow::Result<()> {
    let store = ConfigStore::load(config_path).await?;
    let config: Arc<AppConfig> = store.get();
    config.validate().map_err(AppError::Config)?;

    println!("# {}", store.path().display());
    print!("{}", render_config(&config));

    let registry = DeviceRegistry::new(config.devices.mapping_dir.clone());
    let mut malformed = 0;
    println!();
    println!("# aliases in {}", registry.mapping_dir().display());
    for (alias, target) in registry.list()? {
        match target {
            Ok(target) => println!("{} -> {}", alias, target),
            Err(e) => {
                malformed += 1;
                println!("{} -> INVALID ({})", alias, e);
            }
        }
    }

    if malformed > 0 {
        return Err(AppError::Config(format!("{} malformed alias mapping(s)", malformed)).into());
    }
    Ok(())
}
