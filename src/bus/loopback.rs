//! ALSA loopback card acting as the virtual bus
//!
//! `snd-aloop` pairs every playback sub-device on device 0 with the capture
//! sub-device of the same index on device 1. Sub-device 0 carries the main
//! mix; sub-device 1 is a monitor copy for consumers that must not disturb
//! the main path (the Bluetooth source role, diagnostics).

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{AppError, Result};

/// Default loopback card id
pub const DEFAULT_BUS_CARD: &str = "Loopback";

/// Bus sub-channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusChannel {
    #[default]
    Main,
    Monitor,
}

impl BusChannel {
    pub fn subdevice(&self) -> u32 {
        match self {
            Self::Main => 0,
            Self::Monitor => 1,
        }
    }
}

impl std::fmt::Display for BusChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Monitor => write!(f, "monitor"),
        }
    }
}

impl std::str::FromStr for BusChannel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" | "0" => Ok(Self::Main),
            "monitor" | "1" => Ok(Self::Monitor),
            other => Err(format!("unknown bus channel: {}", other)),
        }
    }
}

/// Loopback card addressing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackBus {
    card: String,
}

impl LoopbackBus {
    pub fn new(card: impl Into<String>) -> Self {
        Self { card: card.into() }
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    /// Device producers write into
    pub fn playback_device(&self, channel: BusChannel) -> String {
        format!("hw:{},0,{}", self.card, channel.subdevice())
    }

    /// Device consumers read from
    pub fn capture_device(&self, channel: BusChannel) -> String {
        format!("hw:{},1,{}", self.card, channel.subdevice())
    }

    /// Holder-registry key for one side of a sub-channel
    pub fn device_key(&self, channel: BusChannel, playback: bool) -> String {
        format!(
            "bus-{}-{}-{}",
            self.card,
            if playback { 0 } else { 1 },
            channel.subdevice()
        )
    }

    /// Verify the loopback card exists; its absence is a fatal platform error
    pub fn probe(&self) -> Result<()> {
        self.probe_in(Path::new("/proc/asound"))
    }

    pub fn probe_in(&self, asound_root: &Path) -> Result<()> {
        let card_dir = asound_root.join(&self.card);
        if card_dir.exists() {
            debug!("Loopback card {} present at {}", self.card, card_dir.display());
            info!("Virtual bus on loopback card {}", self.card);
            Ok(())
        } else {
            Err(AppError::Platform(format!(
                "loopback card {} not found (is snd-aloop loaded?)",
                self.card
            )))
        }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CARD)
    }
}
