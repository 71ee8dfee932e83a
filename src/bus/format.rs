//! Fixed bus sample format

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Sample format of every stream attached to the virtual bus
///
/// The bus never resamples; a producer at any other rate converts before
/// writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u32,
    /// Bytes per sample (S16LE = 2)
    pub sample_width: u32,
}

impl BusFormat {
    /// 48 kHz, stereo, signed 16-bit little-endian
    pub const NATIVE: BusFormat = BusFormat {
        sample_rate: 48_000,
        channels: 2,
        sample_width: 2,
    };

    /// Bytes per audio frame (one sample on every channel)
    pub fn bytes_per_frame(&self) -> usize {
        (self.channels * self.sample_width) as usize
    }

    /// Number of audio frames covering `duration`
    pub fn frames_for(&self, duration: Duration) -> usize {
        (self.sample_rate as u128 * duration.as_micros() / 1_000_000) as usize
    }

    /// Number of bytes covering `duration`
    pub fn bytes_for(&self, duration: Duration) -> usize {
        self.frames_for(duration) * self.bytes_per_frame()
    }

    /// Playback duration of `bytes` of interleaved PCM
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let frames = (bytes / self.bytes_per_frame()) as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }

    /// Refuse any stream that would require conversion inside the bus
    pub fn ensure_compatible(&self, other: &BusFormat) -> Result<(), String> {
        if self == other {
            Ok(())
        } else {
            Err(format!("stream format {} does not match bus format {}", other, self))
        }
    }
}

impl Default for BusFormat {
    fn default() -> Self {
        Self::NATIVE
    }
}

impl fmt::Display for BusFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/S{}LE",
            self.sample_rate,
            self.channels,
            self.sample_width * 8
        )
    }
}
