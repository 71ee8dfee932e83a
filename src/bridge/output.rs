//! Output bridge: virtual bus → aliased destination
//!
//! The alias is resolved before any device is touched, so an unconfigured
//! alias exits with its own code instead of looking like a device failure.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::attach::{attach_with_retry, AttachPolicy};
use super::relay::{Relay, RelayConfig, RelayStats};
use super::{open_options, AlsaOpener, BridgeError, PcmOpener};
use crate::bus::{BusChannel, BusFormat, LoopbackBus, StreamDirection, StreamSession};
use crate::config::AppConfig;
use crate::registry::{DeviceAlias, DeviceRegistry, HolderRegistry, PcmTarget, TargetClass};

pub struct OutputBridge {
    alias: DeviceAlias,
    target: PcmTarget,
    channel: BusChannel,
    config: Arc<AppConfig>,
    bus: LoopbackBus,
    holders: HolderRegistry,
    opener: Arc<dyn PcmOpener>,
    cancel: CancellationToken,
}

impl OutputBridge {
    /// Validate and resolve `alias`; no device I/O happens here
    pub fn prepare(
        alias: &str,
        config: Arc<AppConfig>,
        registry: &DeviceRegistry,
    ) -> Result<Self, BridgeError> {
        let alias = DeviceAlias::new(alias)?;
        let target = registry.resolve(&alias)?;
        info!("Output bridge {} -> {}", alias, target);

        Ok(Self {
            alias,
            target,
            channel: BusChannel::Main,
            bus: LoopbackBus::new(config.bus.card.clone()),
            holders: HolderRegistry::new(config.devices.holder_dir.clone()),
            config,
            opener: Arc::new(AlsaOpener),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_opener(mut self, opener: Arc<dyn PcmOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_channel(mut self, channel: BusChannel) -> Self {
        self.channel = channel;
        self
    }

    pub fn alias(&self) -> &DeviceAlias {
        &self.alias
    }

    pub fn target(&self) -> &PcmTarget {
        &self.target
    }

    /// Relay until cancelled or a hard failure
    ///
    /// Blocking; run on a dedicated thread.
    pub fn run(&self) -> Result<RelayStats, BridgeError> {
        let class = self.target.class();
        let profile = self.config.latency.profile_for(class);
        let attach = &self.config.attach;
        let device = self.target.alsa_device();

        // Contention with other writers is left to the supervisor's scan
        let session = StreamSession::new(
            StreamDirection::Playback,
            &device,
            self.target.device_key(),
            profile,
        );
        let claim = self.holders.acquire(session)?;

        let result = (|| {
            let bus_dev = self.bus.capture_device(self.channel);
            let bus_opts = open_options(&bus_dev, StreamDirection::Capture, profile, attach);
            let bus_policy = AttachPolicy::from_config(attach);
            let reader = attach_with_retry(&bus_dev, &bus_policy, &self.cancel, || {
                self.opener.open_reader(&bus_opts)
            })?;

            let out_opts = open_options(&device, StreamDirection::Playback, profile, attach);
            let out_policy =
                AttachPolicy::from_config(attach).with_retry_io(class == TargetClass::Bluetooth);
            let writer = attach_with_retry(&device, &out_policy, &self.cancel, || {
                self.opener.open_writer(&out_opts)
            })?;

            info!(
                "Relaying bus {} to {} ({} us buffer, {} us period)",
                self.channel, device, profile.buffer_time_us, profile.period_time_us
            );
            let mut relay_config =
                RelayConfig::new(profile.period_bytes(&BusFormat::NATIVE), profile.period());
            // The bus is silent whenever no source plays
            relay_config.stall_limit = u32::MAX;

            Relay::new(relay_config, self.cancel.clone())
                .run(reader, writer)
                .into_result()
        })();

        if let Err(e) = claim.release() {
            warn!("Failed to release claim on {}: {}", device, e);
        }

        match result {
            Err(BridgeError::Cancelled) => Ok(RelayStats::default()),
            other => other,
        }
    }
}
