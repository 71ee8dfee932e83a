//! Bluetooth source bridge
//!
//! Joins a BlueALSA endpoint and the virtual bus. In the sink role a phone
//! streams A2DP into this host and the bridge copies it onto the bus main
//! channel; in the source role the bridge feeds the bus monitor channel to a
//! Bluetooth speaker.
//!
//! BlueALSA drops the PCM whenever the link goes away and often keeps
//! delivering nothing after a profile renegotiation, so the capture is
//! recycled on device-gone and on stalls, rate-limited by a cooldown. In the
//! sink role a bus main channel held by another writer is waited out at the
//! same cooldown rather than treated as a failure.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::attach::{attach_with_retry, AttachPolicy};
use super::relay::{Relay, RelayConfig};
use super::{open_options, sleep_unless_cancelled, AlsaOpener, BridgeError, PcmOpener};
use crate::bus::pcm::{PcmReader, PcmWriter, TeeWriter};
use crate::bus::{BusChannel, BusFormat, LoopbackBus, StreamDirection, StreamSession};
use crate::config::AppConfig;
use crate::registry::{BtProfile, HolderRegistry, MacAddress, PcmTarget};
use crate::utils::process::{ProcessControl, SystemProcessControl};

/// Direction of audio over the Bluetooth link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BtRole {
    /// Peer plays into this host (capture from BlueALSA, write the bus)
    #[default]
    Sink,
    /// This host plays to the peer (read the bus monitor, play to BlueALSA)
    Source,
}

impl FromStr for BtRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sink" => Ok(Self::Sink),
            "source" => Ok(Self::Source),
            other => Err(format!("unknown Bluetooth role: {}", other)),
        }
    }
}

impl std::fmt::Display for BtRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sink => write!(f, "sink"),
            Self::Source => write!(f, "source"),
        }
    }
}

pub struct BluetoothBridge {
    address: MacAddress,
    profile: BtProfile,
    role: BtRole,
    config: Arc<AppConfig>,
    bus: LoopbackBus,
    holders: HolderRegistry,
    control: Arc<dyn ProcessControl>,
    opener: Arc<dyn PcmOpener>,
    cancel: CancellationToken,
}

impl BluetoothBridge {
    pub fn new(
        address: MacAddress,
        role: BtRole,
        config: Arc<AppConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            address,
            profile: BtProfile::A2dp,
            role,
            bus: LoopbackBus::new(config.bus.card.clone()),
            holders: HolderRegistry::new(config.devices.holder_dir.clone()),
            config,
            control: Arc::new(SystemProcessControl),
            opener: Arc::new(AlsaOpener),
            cancel,
        }
    }

    pub fn with_profile(mut self, profile: BtProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_opener(mut self, opener: Arc<dyn PcmOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_process_control(mut self, control: Arc<dyn ProcessControl>) -> Self {
        self.control = control;
        self
    }

    pub fn target(&self) -> PcmTarget {
        PcmTarget::Bluetooth {
            address: self.address,
            profile: self.profile,
        }
    }

    /// Claim the device and relay until cancelled or out of recycles
    ///
    /// Blocking; run on a dedicated thread.
    pub fn run(&self) -> Result<(), BridgeError> {
        let target = self.target();
        let device = target.alsa_device();
        let direction = match self.role {
            BtRole::Sink => StreamDirection::Capture,
            BtRole::Source => StreamDirection::Playback,
        };

        // Exactly one bridge per MAC+profile: tear down whoever holds it
        let session = StreamSession::new(
            direction,
            &device,
            target.device_key(),
            self.config.latency.bluetooth_profile(),
        );
        let claim = self.holders.acquire_exclusive(
            session,
            self.control.as_ref(),
            self.config.supervisor.stop_timeout(),
        )?;
        info!("Bluetooth {} bridge for {} started", self.role, self.address);

        let result = self.recycle_loop(&device);

        if let Err(e) = claim.release() {
            warn!("Failed to release claim on {}: {}", device, e);
        }
        result
    }

    fn recycle_loop(&self, device: &str) -> Result<(), BridgeError> {
        let attach = &self.config.attach;
        let cooldown = attach.recycle_cooldown();
        let mut recycles = 0u32;
        let mut last_attach: Option<Instant> = None;

        loop {
            if let Some(at) = last_attach {
                let since = at.elapsed();
                if since < cooldown && !sleep_unless_cancelled(cooldown - since, &self.cancel) {
                    return Ok(());
                }
            }
            last_attach = Some(Instant::now());

            let (reader, writer) = match self.open_endpoints(device) {
                Ok(endpoints) => endpoints,
                Err(BridgeError::Cancelled) => return Ok(()),
                // Another source (network ingest) is writing the bus
                Err(BridgeError::AttachFailed { device: busy, last, .. })
                    if self.role == BtRole::Sink
                        && busy == self.bus.playback_device(BusChannel::Main) =>
                {
                    warn!("Bus {} held by another writer ({}), waiting", busy, last);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let _bus_claim = match self.role {
                BtRole::Sink => Some(self.holders.acquire(StreamSession::new(
                    StreamDirection::Playback,
                    self.bus.playback_device(BusChannel::Main),
                    self.bus.device_key(BusChannel::Main, true),
                    self.config.latency.bluetooth_profile(),
                ))?),
                BtRole::Source => None,
            };

            let report = Relay::new(self.relay_config(), self.cancel.clone()).run(reader, writer);
            match report.error {
                None => return Ok(()),
                Some(e) if e.is_recyclable() => {
                    // Audio flowed for a while: the budget covers flapping,
                    // not an occasional disconnect
                    if report.stats.frames_read > attach.stall_limit as u64 {
                        recycles = 0;
                    }
                    recycles += 1;
                    if recycles > attach.recycle_budget {
                        return Err(BridgeError::RecycleExhausted {
                            device: device.to_string(),
                            budget: attach.recycle_budget,
                            last: Box::new(e),
                        });
                    }
                    warn!(
                        "Recycling {} ({}/{}): {}",
                        device, recycles, attach.recycle_budget, e
                    );
                }
                Some(e) => return Err(e),
            }
        }
    }

    fn relay_config(&self) -> RelayConfig {
        let profile = self.config.latency.bluetooth_profile();
        let mut config = RelayConfig::new(
            profile.period_bytes(&BusFormat::NATIVE),
            profile.period(),
        );
        config.stall_limit = match self.role {
            BtRole::Sink => self.config.attach.stall_limit.max(1),
            // Silence on the bus is not a device fault
            BtRole::Source => u32::MAX,
        };
        config
    }

    fn open_endpoints(
        &self,
        device: &str,
    ) -> Result<(Box<dyn PcmReader>, Box<dyn PcmWriter>), BridgeError> {
        let attach = &self.config.attach;
        let profile = self.config.latency.bluetooth_profile();
        let bt_policy = AttachPolicy::from_config(attach).with_retry_io(true);
        let bus_policy = AttachPolicy::from_config(attach);

        match self.role {
            BtRole::Sink => {
                let bt_opts = open_options(device, StreamDirection::Capture, profile, attach);
                let reader = attach_with_retry(device, &bt_policy, &self.cancel, || {
                    self.opener.open_reader(&bt_opts)
                })?;

                let main_dev = self.bus.playback_device(BusChannel::Main);
                let main_opts = open_options(&main_dev, StreamDirection::Playback, profile, attach);
                let main = attach_with_retry(&main_dev, &bus_policy, &self.cancel, || {
                    self.opener.open_writer(&main_opts)
                })?;

                let mirror = if self.config.bus.mirror {
                    let mon_dev = self.bus.playback_device(BusChannel::Monitor);
                    let mon_opts =
                        open_options(&mon_dev, StreamDirection::Playback, profile, attach);
                    match self.opener.open_writer(&mon_opts) {
                        Ok(w) => Some(w),
                        Err(e) => {
                            warn!("Monitor channel unavailable, not mirroring: {}", e);
                            None
                        }
                    }
                } else {
                    None
                };

                Ok((reader, Box::new(TeeWriter::new(main, mirror))))
            }
            BtRole::Source => {
                let mon_dev = self.bus.capture_device(BusChannel::Monitor);
                let mon_opts = open_options(&mon_dev, StreamDirection::Capture, profile, attach);
                let reader = attach_with_retry(&mon_dev, &bus_policy, &self.cancel, || {
                    self.opener.open_reader(&mon_opts)
                })?;

                let bt_opts = open_options(device, StreamDirection::Playback, profile, attach);
                let writer = attach_with_retry(device, &bt_policy, &self.cancel, || {
                    self.opener.open_writer(&bt_opts)
                })?;

                Ok((reader, writer))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::FakeOpener;
    use crate::bus::pcm::tests::ScriptedReader;
    use crate::bus::pcm::PcmError;
    use crate::registry::holders::tests::{session, FakeProcesses};

    fn test_config(dir: &std::path::Path) -> Arc<AppConfig> {
        let mut config = AppConfig::default();
        config.devices.holder_dir = dir.to_path_buf();
        config.bus.mirror = false;
        config.attach.backoff_ms = 1;
        config.attach.recycle_cooldown_ms = 5;
        config.attach.recycle_budget = 1;
        config.attach.stall_limit = 1000;
        config.supervisor.stop_timeout_secs = 0;
        Arc::new(config)
    }

    fn mac() -> MacAddress {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    fn bridge(config: Arc<AppConfig>, opener: Arc<FakeOpener>) -> BluetoothBridge {
        BluetoothBridge::new(mac(), BtRole::Sink, config, CancellationToken::new())
            .with_opener(opener)
            .with_process_control(Arc::new(FakeProcesses::default()))
    }

    fn gone_after_data() -> ScriptedReader {
        ScriptedReader::new(vec![
            Ok(vec![1u8; 16]),
            Err(PcmError::Gone("bluealsa".into())),
        ])
    }

    #[test]
    fn test_recycles_on_device_gone_then_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(FakeOpener::default());
        opener.readers.lock().push_back(Ok(gone_after_data()));
        opener.readers.lock().push_back(Ok(gone_after_data()));

        let result = bridge(test_config(dir.path()), opener.clone()).run();

        assert!(matches!(
            result,
            Err(BridgeError::RecycleExhausted { budget: 1, .. })
        ));
        let bt_opens = opener
            .opened
            .lock()
            .iter()
            .filter(|d| d.starts_with("bluealsa:DEV=AA:BB:CC:DD:EE:FF"))
            .count();
        assert_eq!(bt_opens, 2);
        assert!(!opener.writer.written.lock().is_empty());

        // Claim released on exit
        let holders = HolderRegistry::new(dir.path());
        assert!(holders.claims().unwrap().is_empty());
    }

    #[test]
    fn test_attach_failure_is_not_recycled() {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(FakeOpener::default());
        for _ in 0..3 {
            opener
                .readers
                .lock()
                .push_back(Err(PcmError::Gone("bluealsa".into())));
        }

        let result = bridge(test_config(dir.path()), opener).run();
        assert!(matches!(
            result,
            Err(BridgeError::AttachFailed { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_sink_waits_while_bus_is_held_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(FakeOpener::default());
        opener
            .readers
            .lock()
            .push_back(Ok(ScriptedReader::new(Vec::new())));
        opener.readers.lock().push_back(Ok(gone_after_data()));
        opener.readers.lock().push_back(Ok(gone_after_data()));
        opener
            .writer_failures
            .lock()
            .extend((0..3).map(|_| PcmError::Busy("hw:Loopback,0,0".into())));

        let result = bridge(test_config(dir.path()), opener.clone()).run();

        // The busy bus cost no recycle budget: both later captures ran
        assert!(matches!(
            result,
            Err(BridgeError::RecycleExhausted { budget: 1, .. })
        ));
        let bus_opens = opener
            .opened
            .lock()
            .iter()
            .filter(|d| d.as_str() == "hw:Loopback,0,0")
            .count();
        assert_eq!(bus_opens, 5);
        assert!(!opener.writer.written.lock().is_empty());
    }

    #[test]
    fn test_preempts_previous_holder() {
        let dir = tempfile::tempdir().unwrap();
        let holders = HolderRegistry::new(dir.path());
        let key = PcmTarget::Bluetooth {
            address: mac(),
            profile: BtProfile::A2dp,
        }
        .device_key();
        let mut prior = session(&key, 4242);
        prior.direction = StreamDirection::Capture;
        std::mem::forget(holders.acquire(prior).unwrap());

        let procs = Arc::new(FakeProcesses::with_alive(&[4242]));
        let opener = Arc::new(FakeOpener::default());
        opener.readers.lock().extend((0..3).map(|_| {
            Err(PcmError::Io {
                device: "bluealsa".into(),
                reason: "EINVAL".into(),
            })
        }));

        let _ = BluetoothBridge::new(
            mac(),
            BtRole::Sink,
            test_config(dir.path()),
            CancellationToken::new(),
        )
        .with_opener(opener)
        .with_process_control(procs.clone())
        .run();

        assert_eq!(*procs.terminated.lock(), vec![4242]);
        assert!(holders.claims().unwrap().is_empty());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Source".parse::<BtRole>().unwrap(), BtRole::Source);
        assert!("relay".parse::<BtRole>().is_err());
    }
}
