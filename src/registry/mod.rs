//! Device registry
//!
//! This module provides:
//! - Logical alias → concrete PCM target resolution (mapping files)
//! - The device holder registry ("who currently holds device X")
//! - ALSA playback hardware enumeration

pub mod alias;
pub mod hardware;
pub mod holders;
pub mod store;

pub use alias::{BtProfile, DeviceAlias, HwScheme, MacAddress, PcmTarget, TargetClass};
pub use hardware::{
    enumerate_playback_devices, ensure_audio_hardware, select_default_device, PlaybackDeviceInfo,
};
pub use holders::{Claim, DeviceClaim, HolderRegistry};
pub use store::DeviceRegistry;

use thiserror::Error;

/// Errors raised by the device registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown alias: {0}")]
    UnknownAlias(String),

    #[error("invalid alias name: {0:?}")]
    InvalidAlias(String),

    #[error("malformed PCM target {input:?}: {reason}")]
    Malformed { input: String, reason: String },

    #[error("claim error: {0}")]
    Claim(String),

    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Whether this error is a configuration problem that retrying cannot fix
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownAlias(_) | Self::InvalidAlias(_) | Self::Malformed { .. }
        )
    }
}
