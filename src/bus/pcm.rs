//! PCM endpoints
//!
//! Blocking, period-granular reader/writer traits with an ALSA
//! implementation. Every call is bounded: devices are opened non-blocking
//! and each transfer waits at most `io_timeout` for the device to become
//! ready, so a stuck stream surfaces as [`PcmError::Timeout`] instead of
//! hanging the bridge.

use alsa::pcm::{Access, Format, HwParams, State, IO};
use alsa::{Direction, ValueOr, PCM};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::format::BusFormat;
use super::session::StreamDirection;
use crate::utils::LogThrottler;

/// Retry interval while a device reports EBUSY during acquisition
const ACQUIRE_RETRY: Duration = Duration::from_millis(50);

/// Buffer and period time pair for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferProfile {
    /// Total ring buffer time in microseconds
    pub buffer_time_us: u32,
    /// Period (transfer granularity) in microseconds
    pub period_time_us: u32,
}

impl BufferProfile {
    pub const fn new(buffer_time_us: u32, period_time_us: u32) -> Self {
        Self {
            buffer_time_us,
            period_time_us,
        }
    }

    /// Low-latency local hardware: 10 ms buffer
    pub const fn hardware_default() -> Self {
        Self::new(10_000, 2_500)
    }

    /// Bluetooth playback/capture: 40 ms buffer
    pub const fn bluetooth_default() -> Self {
        Self::new(40_000, 10_000)
    }

    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_time_us as u64)
    }

    pub fn period_frames(&self, format: &BusFormat) -> usize {
        format.frames_for(self.period())
    }

    pub fn period_bytes(&self, format: &BusFormat) -> usize {
        format.bytes_for(self.period())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.period_time_us == 0 || self.buffer_time_us == 0 {
            return Err("buffer and period time must be non-zero".to_string());
        }
        if self.period_time_us > self.buffer_time_us {
            return Err(format!(
                "period time {}us exceeds buffer time {}us",
                self.period_time_us, self.buffer_time_us
            ));
        }
        Ok(())
    }
}

/// PCM endpoint errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PcmError {
    /// XRun; the stream was re-prepared and may continue
    #[error("buffer underrun/overrun on {0}")]
    Underrun(String),

    /// Device not ready within the I/O timeout
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Device disappeared (unplugged, Bluetooth link dropped, profile gone)
    #[error("device gone: {0}")]
    Gone(String),

    /// Device held by another stream
    #[error("device busy: {0}")]
    Busy(String),

    #[error("PCM I/O error on {device}: {reason}")]
    Io { device: String, reason: String },
}

impl PcmError {
    /// Errors worth retrying when attaching
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Gone(_) | Self::Timeout(_))
    }

    /// Map an ALSA error onto the taxonomy by errno name or description
    pub fn from_alsa(device: &str, err: &alsa::Error) -> Self {
        let desc = err.to_string();
        let has = |name: &str, text: &str| desc.contains(name) || desc.contains(text);

        if has("EPIPE", "Broken pipe") || has("ESTRPIPE", "Streams pipe error") {
            Self::Underrun(device.to_string())
        } else if has("EBUSY", "Device or resource busy") {
            Self::Busy(device.to_string())
        } else if has("ENODEV", "No such device") || has("ENOENT", "No such file") {
            Self::Gone(device.to_string())
        } else if has("EAGAIN", "temporarily unavailable") {
            Self::Timeout(device.to_string())
        } else {
            Self::Io {
                device: device.to_string(),
                reason: desc,
            }
        }
    }
}

/// Blocking period reader
pub trait PcmReader: Send {
    /// Read up to one period into `buf`, returning the bytes read
    fn read_period(&mut self, buf: &mut [u8]) -> Result<usize, PcmError>;

    fn device(&self) -> &str;
}

/// Blocking period writer
pub trait PcmWriter: Send {
    /// Write all of `buf`
    fn write_period(&mut self, buf: &[u8]) -> Result<(), PcmError>;

    fn device(&self) -> &str;
}

/// Parameters for opening an ALSA stream
#[derive(Debug, Clone)]
pub struct PcmOpenOptions {
    pub device: String,
    pub direction: StreamDirection,
    pub format: BusFormat,
    pub profile: BufferProfile,
    /// Upper bound on waiting for a busy device
    pub acquire_timeout: Duration,
    /// Upper bound on a single transfer
    pub io_timeout: Duration,
}

/// ALSA stream bound to one device
pub struct AlsaPcm {
    pcm: PCM,
    device: String,
    direction: StreamDirection,
    format: BusFormat,
    io_timeout_ms: u32,
}

impl AlsaPcm {
    /// Open and configure a device, retrying EBUSY until `acquire_timeout`
    pub fn open(opts: &PcmOpenOptions) -> Result<Self, PcmError> {
        opts.profile.validate().map_err(|reason| PcmError::Io {
            device: opts.device.clone(),
            reason,
        })?;

        let direction = match opts.direction {
            StreamDirection::Capture => Direction::Capture,
            StreamDirection::Playback => Direction::Playback,
        };

        let deadline = Instant::now() + opts.acquire_timeout;
        let pcm = loop {
            match PCM::new(&opts.device, direction, true) {
                Ok(pcm) => break pcm,
                Err(e) => {
                    let err = PcmError::from_alsa(&opts.device, &e);
                    if matches!(err, PcmError::Busy(_)) && Instant::now() < deadline {
                        std::thread::sleep(ACQUIRE_RETRY);
                        continue;
                    }
                    return Err(err);
                }
            }
        };

        let io_err = |e: alsa::Error| PcmError::from_alsa(&opts.device, &e);

        // Configure hardware parameters
        {
            let hwp = HwParams::any(&pcm).map_err(io_err)?;
            hwp.set_channels(opts.format.channels).map_err(io_err)?;
            hwp.set_rate(opts.format.sample_rate, ValueOr::Nearest)
                .map_err(io_err)?;
            hwp.set_format(Format::s16()).map_err(io_err)?;
            hwp.set_access(Access::RWInterleaved).map_err(io_err)?;
            hwp.set_buffer_time_near(opts.profile.buffer_time_us, ValueOr::Nearest)
                .map_err(io_err)?;
            hwp.set_period_time_near(opts.profile.period_time_us, ValueOr::Nearest)
                .map_err(io_err)?;
            pcm.hw_params(&hwp).map_err(io_err)?;
        }

        // The bus never resamples; a device that cannot run the bus rate is
        // refused instead of silently drifting.
        let actual_rate = pcm
            .hw_params_current()
            .and_then(|h| h.get_rate())
            .unwrap_or(opts.format.sample_rate);
        if actual_rate != opts.format.sample_rate {
            return Err(PcmError::Io {
                device: opts.device.clone(),
                reason: format!(
                    "device runs at {}Hz, bus requires {}Hz",
                    actual_rate, opts.format.sample_rate
                ),
            });
        }

        pcm.prepare().map_err(io_err)?;
        if opts.direction == StreamDirection::Capture {
            pcm.start().map_err(io_err)?;
        }

        info!(
            "Opened {} for {} ({}, buffer {}us, period {}us)",
            opts.device,
            opts.direction,
            opts.format,
            opts.profile.buffer_time_us,
            opts.profile.period_time_us
        );

        Ok(Self {
            pcm,
            device: opts.device.clone(),
            direction: opts.direction,
            format: opts.format,
            io_timeout_ms: opts.io_timeout.as_millis().min(u32::MAX as u128) as u32,
        })
    }

    fn recover(&self) {
        if let Err(e) = self.pcm.prepare() {
            warn!("Failed to re-prepare {}: {}", self.device, e);
            return;
        }
        if self.direction == StreamDirection::Capture {
            let _ = self.pcm.start();
        }
    }

    /// Check stream state and wait for readiness
    fn ready(&self) -> Result<(), PcmError> {
        match self.pcm.state() {
            State::XRun => {
                self.recover();
                return Err(PcmError::Underrun(self.device.clone()));
            }
            State::Suspended => {
                debug!("{} suspended, resuming", self.device);
                if self.pcm.resume().is_err() {
                    self.recover();
                }
                return Err(PcmError::Underrun(self.device.clone()));
            }
            State::Disconnected => return Err(PcmError::Gone(self.device.clone())),
            _ => {}
        }

        match self.pcm.wait(Some(self.io_timeout_ms)) {
            Ok(true) => Ok(()),
            Ok(false) => Err(PcmError::Timeout(self.device.clone())),
            Err(e) => Err(self.classify(e)),
        }
    }

    fn classify(&self, e: alsa::Error) -> PcmError {
        let err = PcmError::from_alsa(&self.device, &e);
        if matches!(err, PcmError::Underrun(_)) {
            self.recover();
        }
        err
    }
}

impl PcmReader for AlsaPcm {
    fn read_period(&mut self, buf: &mut [u8]) -> Result<usize, PcmError> {
        self.ready()?;

        // io_bytes() rather than io_checked(): many USB and BlueALSA devices
        // don't support mmap access
        let io: IO<u8> = self.pcm.io_bytes();
        match io.readi(buf) {
            Ok(frames) => Ok(frames * self.format.bytes_per_frame()),
            Err(e) => Err(self.classify(e)),
        }
    }

    fn device(&self) -> &str {
        &self.device
    }
}

impl PcmWriter for AlsaPcm {
    fn write_period(&mut self, buf: &[u8]) -> Result<(), PcmError> {
        let bpf = self.format.bytes_per_frame();
        let mut offset = 0;

        while offset < buf.len() {
            self.ready()?;
            let io: IO<u8> = self.pcm.io_bytes();
            match io.writei(&buf[offset..]) {
                Ok(frames) => offset += frames * bpf,
                Err(e) => return Err(self.classify(e)),
            }
        }
        Ok(())
    }

    fn device(&self) -> &str {
        &self.device
    }
}

impl Drop for AlsaPcm {
    fn drop(&mut self) {
        if self.direction == StreamDirection::Playback {
            let _ = self.pcm.drop();
        }
        debug!("Closed {}", self.device);
    }
}

/// Writes the main sub-channel and mirrors into a monitor sub-channel
///
/// Mirror failures are logged (throttled) and never fail the main path.
pub struct TeeWriter {
    main: Box<dyn PcmWriter>,
    mirror: Option<Box<dyn PcmWriter>>,
    throttler: LogThrottler,
}

impl TeeWriter {
    pub fn new(main: Box<dyn PcmWriter>, mirror: Option<Box<dyn PcmWriter>>) -> Self {
        Self {
            main,
            mirror,
            throttler: LogThrottler::with_secs(5),
        }
    }
}

impl PcmWriter for TeeWriter {
    fn write_period(&mut self, buf: &[u8]) -> Result<(), PcmError> {
        self.main.write_period(buf)?;
        if let Some(mirror) = self.mirror.as_mut() {
            if let Err(e) = mirror.write_period(buf) {
                crate::warn_throttled!(self.throttler, "mirror", "Monitor mirror write failed: {}", e);
            }
        }
        Ok(())
    }

    fn device(&self) -> &str {
        self.main.device()
    }
}
