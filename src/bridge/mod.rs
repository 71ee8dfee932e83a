//! Bridges between devices and the virtual bus
//!
//! Every bridge is a [`relay::Relay`] between a [`PcmReader`] and a
//! [`PcmWriter`]. What differs is where the endpoints come from and how
//! failures are recycled:
//! - [`bluetooth`]: BlueALSA peer to/from the bus, one per MAC+profile
//! - [`ingest`]: network PCM stream into the bus
//! - [`output`]: bus to an aliased destination
//!
//! [`coordinator`] keeps the Bluetooth peer alias current as devices pair.

pub mod attach;
pub mod bluetooth;
pub mod coordinator;
pub mod ingest;
pub mod output;
pub mod relay;

pub use attach::{attach_with_retry, AttachPolicy};
pub use bluetooth::{BluetoothBridge, BtRole};
pub use coordinator::PeerCoordinator;
pub use ingest::{IngestServer, LatencyController};
pub use output::OutputBridge;
pub use relay::{Relay, RelayConfig, RelayReport, RelayStats};

use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bus::pcm::{
    AlsaPcm, BufferProfile, PcmError, PcmOpenOptions, PcmReader, PcmWriter,
};
use crate::bus::{BusFormat, StreamDirection};
use crate::config::AttachConfig;
use crate::error::{ErrorCategory, EXIT_UNKNOWN_ALIAS};
use crate::registry::RegistryError;

/// Consecutive hard I/O errors on one stage before the bridge gives up
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Relay stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStage {
    Reader,
    Writer,
}

impl fmt::Display for RelayStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader => write!(f, "reader"),
            Self::Writer => write!(f, "writer"),
        }
    }
}

/// Bridge errors
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pcm(#[from] PcmError),

    #[error("could not attach {device} after {attempts} attempts: {last}")]
    AttachFailed {
        device: String,
        attempts: u32,
        last: PcmError,
    },

    #[error("{stage} on {device} failed {count} times in a row: {last}")]
    Escalated {
        stage: RelayStage,
        device: String,
        count: u32,
        last: PcmError,
    },

    #[error("device gone: {0}")]
    DeviceGone(String),

    #[error("no audio from {device} for {reads} consecutive reads")]
    Stalled { device: String, reads: u32 },

    #[error("format mismatch: {0}")]
    Format(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{device} contended by pid {pid}")]
    Contention { device: String, pid: i32 },

    #[error("recycle budget of {budget} exhausted on {device}: {last}")]
    RecycleExhausted {
        device: String,
        budget: u32,
        last: Box<BridgeError>,
    },

    #[error("worker thread panicked: {0}")]
    Panicked(String),
}

impl BridgeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Registry(e) if e.is_configuration() => ErrorCategory::Configuration,
            Self::Format(_) => ErrorCategory::Configuration,
            Self::Pcm(e) if e.is_transient() => ErrorCategory::Transient,
            Self::DeviceGone(_) | Self::Stalled { .. } => ErrorCategory::Transient,
            Self::Contention { .. } => ErrorCategory::Contention,
            _ => ErrorCategory::Runtime,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Registry(RegistryError::UnknownAlias(_)) => EXIT_UNKNOWN_ALIAS,
            _ => self.category().exit_code(),
        }
    }

    /// Failures the Bluetooth bridge answers by recycling its capture
    pub fn is_recyclable(&self) -> bool {
        matches!(self, Self::DeviceGone(_) | Self::Stalled { .. })
    }
}

/// Source of PCM endpoints; lets bridges run against fake devices
pub trait PcmOpener: Send + Sync {
    fn open_reader(&self, opts: &PcmOpenOptions) -> Result<Box<dyn PcmReader>, PcmError>;

    fn open_writer(&self, opts: &PcmOpenOptions) -> Result<Box<dyn PcmWriter>, PcmError>;
}

/// Opens real ALSA devices
#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaOpener;

impl PcmOpener for AlsaOpener {
    fn open_reader(&self, opts: &PcmOpenOptions) -> Result<Box<dyn PcmReader>, PcmError> {
        Ok(Box::new(AlsaPcm::open(opts)?))
    }

    fn open_writer(&self, opts: &PcmOpenOptions) -> Result<Box<dyn PcmWriter>, PcmError> {
        Ok(Box::new(AlsaPcm::open(opts)?))
    }
}

/// Open options for one endpoint with the configured timeouts
pub(crate) fn open_options(
    device: impl Into<String>,
    direction: StreamDirection,
    profile: BufferProfile,
    attach: &AttachConfig,
) -> PcmOpenOptions {
    PcmOpenOptions {
        device: device.into(),
        direction,
        format: BusFormat::NATIVE,
        profile,
        acquire_timeout: attach.acquire_timeout(),
        io_timeout: attach.io_timeout(),
    }
}

/// Sleep for `duration` in short slices; returns `false` if cancelled
pub(crate) fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    const SLICE: Duration = Duration::from_millis(50);
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLICE.min(deadline - now));
    }
}
