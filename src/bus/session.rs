//! Stream sessions attached to the bus or to a target device

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::format::BusFormat;
use super::pcm::BufferProfile;

/// Direction of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamDirection {
    Capture,
    Playback,
}

impl std::fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capture => write!(f, "capture"),
            Self::Playback => write!(f, "playback"),
        }
    }
}

/// One active producer or consumer attachment
///
/// The format is fixed for the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSession {
    pub id: Uuid,
    pub direction: StreamDirection,
    pub format: BusFormat,
    pub buffer_time_us: u32,
    pub period_time_us: u32,
    /// Owning process
    pub pid: i32,
    /// ALSA device name opened by the session
    pub device: String,
    /// Key of the physical device, shared by every session on it
    pub device_key: String,
    pub started_at: DateTime<Utc>,
}

impl StreamSession {
    /// New session owned by the current process
    pub fn new(
        direction: StreamDirection,
        device: impl Into<String>,
        device_key: impl Into<String>,
        profile: BufferProfile,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            format: BusFormat::NATIVE,
            buffer_time_us: profile.buffer_time_us,
            period_time_us: profile.period_time_us,
            pid: std::process::id() as i32,
            device: device.into(),
            device_key: device_key.into(),
            started_at: Utc::now(),
        }
    }

    #[cfg(test)]
    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = pid;
        self
    }
}
