use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bus::pcm::BufferProfile;
use crate::bus::queue::MAX_QUEUE_CAPACITY;
use crate::registry::{DeviceAlias, MacAddress, TargetClass};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Alias registry and peer settings
    pub devices: DevicesConfig,
    /// Virtual bus settings
    pub bus: BusConfig,
    /// Buffer sizing per source type
    pub latency: LatencyBudget,
    /// Device acquisition and recovery
    pub attach: AttachConfig,
    /// Network stream ingest
    pub ingest: IngestConfig,
    /// Health supervisor
    pub supervisor: SupervisorConfig,
}

/// Device registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Preferred local output (connection string), auto-selected when unset
    pub default_device: Option<String>,
    /// Last paired Bluetooth peer
    pub peer_address: Option<MacAddress>,
    /// How the Bluetooth worker picks its peer when none is given
    pub peer_mode: PeerMode,
    /// How long the Bluetooth worker waits for bluetoothd and a powered adapter
    pub bt_ready_timeout_secs: u64,
    /// Alias kept pointing at the current Bluetooth peer
    pub peer_alias: DeviceAlias,
    /// Directory of alias mapping files
    pub mapping_dir: PathBuf,
    /// Directory of device holder claims
    pub holder_dir: PathBuf,
    /// Single-instance lock for the daemon
    pub lock_file: PathBuf,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            default_device: None,
            peer_address: None,
            peer_mode: PeerMode::Auto,
            bt_ready_timeout_secs: 20,
            peer_alias: DeviceAlias::default_peer(),
            mapping_dir: PathBuf::from("/etc/audio-router/pcm"),
            holder_dir: PathBuf::from("/run/audio-router/holders"),
            lock_file: PathBuf::from("/run/audio-router/router.lock"),
        }
    }
}

impl DevicesConfig {
    pub fn bt_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.bt_ready_timeout_secs)
    }
}

/// Bluetooth peer selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerMode {
    /// Any connected audio device, preferring `peer_address`
    #[default]
    Auto,
    /// Only `peer_address`
    Fixed,
}

impl fmt::Display for PeerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Fixed => write!(f, "fixed"),
        }
    }
}

impl FromStr for PeerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "fixed" => Ok(Self::Fixed),
            other => Err(format!("unknown peer mode {:?}, expected auto or fixed", other)),
        }
    }
}

/// Virtual bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Loopback card id
    pub card: String,
    /// Mirror bus writes into the monitor sub-channel
    pub mirror: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            card: crate::bus::DEFAULT_BUS_CARD.to_string(),
            mirror: true,
        }
    }
}

/// Latency budget per source type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyBudget {
    pub bt_buffer_us: u32,
    pub bt_period_us: u32,
    pub hw_buffer_us: u32,
    pub hw_period_us: u32,
    /// Network ingest frame duration
    pub ingest_frame_ms: u32,
    /// Queue depth the ingest latency controller steers toward
    pub ingest_target_frames: usize,
    /// Dead band around the target depth
    pub ingest_hysteresis_frames: usize,
}

impl Default for LatencyBudget {
    fn default() -> Self {
        let hw = BufferProfile::hardware_default();
        let bt = BufferProfile::bluetooth_default();
        Self {
            bt_buffer_us: bt.buffer_time_us,
            bt_period_us: bt.period_time_us,
            hw_buffer_us: hw.buffer_time_us,
            hw_period_us: hw.period_time_us,
            ingest_frame_ms: 20,
            ingest_target_frames: 3,
            ingest_hysteresis_frames: 1,
        }
    }
}

impl LatencyBudget {
    pub fn hardware_profile(&self) -> BufferProfile {
        BufferProfile::new(self.hw_buffer_us, self.hw_period_us)
    }

    pub fn bluetooth_profile(&self) -> BufferProfile {
        BufferProfile::new(self.bt_buffer_us, self.bt_period_us)
    }

    pub fn profile_for(&self, class: TargetClass) -> BufferProfile {
        match class {
            TargetClass::Hardware => self.hardware_profile(),
            TargetClass::Bluetooth => self.bluetooth_profile(),
        }
    }

    pub fn ingest_frame(&self) -> Duration {
        Duration::from_millis(self.ingest_frame_ms as u64)
    }
}

/// Attach and recycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Open attempts before giving up
    pub attempts: u32,
    pub backoff_ms: u64,
    /// How long a busy device is waited on during one open
    pub acquire_timeout_ms: u64,
    /// Upper bound on a single PCM transfer
    pub io_timeout_ms: u64,
    /// Consecutive silent/timed-out reads before the capture is recycled
    pub stall_limit: u32,
    pub recycle_cooldown_ms: u64,
    /// Recycles allowed before the bridge exits non-zero
    pub recycle_budget: u32,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 2_000,
            acquire_timeout_ms: 1_000,
            io_timeout_ms: 500,
            stall_limit: 60,
            recycle_cooldown_ms: 5_000,
            recycle_budget: 5,
        }
    }
}

impl AttachConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn recycle_cooldown(&self) -> Duration {
        Duration::from_millis(self.recycle_cooldown_ms)
    }
}

/// Network ingest configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// TCP listen address for the producer
    pub listen: String,
    /// Frame queue capacity (hard max 64)
    pub queue_cap: usize,
    /// Latency controller tick
    pub control_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8081".to_string(),
            queue_cap: 10,
            control_ms: 100,
        }
    }
}

/// One supervised unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UnitSpec {
    /// External systemd service
    Systemd(String),
    /// Output bridge worker for an alias
    Bridge(DeviceAlias),
    /// Network ingest worker
    Ingest,
    /// Bluetooth source bridge worker (follows `peer_address`)
    BtSource,
}

impl fmt::Display for UnitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Systemd(name) => write!(f, "systemd:{}", name),
            Self::Bridge(alias) => write!(f, "bridge:{}", alias),
            Self::Ingest => write!(f, "ingest"),
            Self::BtSource => write!(f, "bt-source"),
        }
    }
}

impl FromStr for UnitSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once(':') {
            Some(("systemd", name)) if !name.trim().is_empty() => {
                Ok(Self::Systemd(name.trim().to_string()))
            }
            Some(("bridge", alias)) => DeviceAlias::new(alias.trim())
                .map(Self::Bridge)
                .map_err(|e| e.to_string()),
            None if s == "ingest" => Ok(Self::Ingest),
            None if s == "bt-source" => Ok(Self::BtSource),
            _ => Err(format!("unknown unit spec: {:?}", s)),
        }
    }
}

impl TryFrom<String> for UnitSpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UnitSpec> for String {
    fn from(spec: UnitSpec) -> Self {
        spec.to_string()
    }
}

/// Health supervisor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Delay before the first cycle
    pub grace_secs: u64,
    pub poll_interval_secs: u64,
    /// Wait between restart and re-probe
    pub settle_secs: u64,
    /// Consecutive failed recoveries before a unit is marked down
    pub max_restarts: u32,
    /// Timeout for each systemctl invocation and probe
    pub command_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout_secs: u64,
    pub health_log: PathBuf,
    pub health_log_max_bytes: u64,
    pub units: Vec<UnitSpec>,
    /// systemd unit to retarget on a new pairing when the Bluetooth source
    /// runs under systemd rather than as a worker
    pub bt_source_unit: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_secs: 10,
            poll_interval_secs: 30,
            settle_secs: 3,
            max_restarts: 5,
            command_timeout_secs: 10,
            stop_timeout_secs: 3,
            health_log: PathBuf::from("/var/log/audio-router/health.log"),
            health_log_max_bytes: 1024 * 1024,
            units: vec![UnitSpec::Ingest, UnitSpec::BtSource],
            bt_source_unit: None,
        }
    }
}

impl SupervisorConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl AppConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), String> {
        self.latency
            .hardware_profile()
            .validate()
            .map_err(|e| format!("hardware latency: {}", e))?;
        self.latency
            .bluetooth_profile()
            .validate()
            .map_err(|e| format!("bluetooth latency: {}", e))?;

        if self.ingest.queue_cap == 0 || self.ingest.queue_cap > MAX_QUEUE_CAPACITY {
            return Err(format!(
                "ingest_queue_cap must be between 1 and {}",
                MAX_QUEUE_CAPACITY
            ));
        }
        if self.latency.ingest_target_frames == 0
            || self.latency.ingest_target_frames >= self.ingest.queue_cap
        {
            return Err("ingest_target_frames must be non-zero and below ingest_queue_cap".into());
        }
        if self.latency.ingest_frame_ms == 0 {
            return Err("ingest_frame_ms must be non-zero".into());
        }
        if self.attach.attempts == 0 {
            return Err("attach_attempts must be at least 1".into());
        }
        if self.bus.card.trim().is_empty() {
            return Err("bus_card must not be empty".into());
        }
        Ok(())
    }
}
