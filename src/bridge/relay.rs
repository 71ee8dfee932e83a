//! Two-stage relay
//!
//! A reader thread moves periods from a [`PcmReader`] into a bounded
//! [`FrameQueue`]; a writer thread drains the queue into a [`PcmWriter`].
//! The queue decouples the two device clocks: a slow consumer costs the
//! oldest frames, never an unbounded backlog, and a slow producer makes the
//! writer fill in silence so the downstream device keeps running.

use bytes::Bytes;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BridgeError, RelayStage, MAX_CONSECUTIVE_ERRORS};
use crate::bus::pcm::{PcmError, PcmReader, PcmWriter};
use crate::bus::queue::{FrameQueue, Pop};
use crate::utils::LogThrottler;

/// Relay tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bytes per period read from the source
    pub period_bytes: usize,
    /// Frame queue capacity
    pub queue_capacity: usize,
    /// Writer waits this long for a frame before writing silence
    pub starve_after: Duration,
    /// Consecutive empty or timed-out reads before the relay reports a stall
    pub stall_limit: u32,
    /// Pad short reads with silence to a full period
    pub pad_short_reads: bool,
}

impl RelayConfig {
    pub fn new(period_bytes: usize, period: Duration) -> Self {
        Self {
            period_bytes,
            queue_capacity: 4,
            starve_after: period * 2,
            stall_limit: 60,
            pad_short_reads: true,
        }
    }
}

/// Counters collected over one relay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_read: u64,
    pub frames_relayed: u64,
    pub underruns: u64,
    pub evicted: u64,
    pub silence_inserted: u64,
    pub short_reads_padded: u64,
}

/// Outcome of a relay run: stats are kept even when it failed
#[derive(Debug)]
pub struct RelayReport {
    pub stats: RelayStats,
    pub error: Option<BridgeError>,
}

impl RelayReport {
    pub fn into_result(self) -> Result<RelayStats, BridgeError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.stats),
        }
    }
}

/// Counts consecutive hard errors on one stage
struct ErrorBudget {
    stage: RelayStage,
    device: String,
    consecutive: u32,
}

impl ErrorBudget {
    fn new(stage: RelayStage, device: &str) -> Self {
        Self {
            stage,
            device: device.to_string(),
            consecutive: 0,
        }
    }

    fn ok(&mut self) {
        self.consecutive = 0;
    }

    fn fail(&mut self, err: PcmError) -> Result<(), BridgeError> {
        self.consecutive += 1;
        warn!(
            "{} error on {} ({}/{}): {}",
            self.stage, self.device, self.consecutive, MAX_CONSECUTIVE_ERRORS, err
        );
        if self.consecutive >= MAX_CONSECUTIVE_ERRORS {
            return Err(BridgeError::Escalated {
                stage: self.stage,
                device: self.device.clone(),
                count: self.consecutive,
                last: err,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DrainStats {
    pub frames: u64,
    pub underruns: u64,
    pub silence: u64,
}

/// Writer stage: drain `queue` into `writer` until closed or stopped
pub(crate) fn drain_queue(
    queue: &FrameQueue,
    writer: &mut dyn PcmWriter,
    stop: &CancellationToken,
    silence: &[u8],
    starve_after: Duration,
    stats: &mut DrainStats,
) -> Result<(), BridgeError> {
    drain_queue_while(queue, writer, stop, silence, starve_after, stats, || true)
}

/// Like [`drain_queue`], but also returns once the queue starves while
/// `active` reports false.
///
/// The network ingest uses this to let go of the bus when its producer
/// disconnects.
pub(crate) fn drain_queue_while(
    queue: &FrameQueue,
    writer: &mut dyn PcmWriter,
    stop: &CancellationToken,
    silence: &[u8],
    starve_after: Duration,
    stats: &mut DrainStats,
    active: impl Fn() -> bool,
) -> Result<(), BridgeError> {
    let throttler = LogThrottler::with_secs(5);
    let mut budget = ErrorBudget::new(RelayStage::Writer, writer.device());

    while !stop.is_cancelled() {
        let result = match queue.pop_timeout(starve_after) {
            Pop::Frame(frame) => writer.write_period(&frame).map(|_| stats.frames += 1),
            Pop::Timeout if !active() => break,
            Pop::Timeout => {
                stats.silence += 1;
                crate::warn_throttled!(
                    throttler,
                    "starved",
                    "No audio for {:?}, writing silence to {}",
                    starve_after,
                    writer.device()
                );
                writer.write_period(silence)
            }
            Pop::Closed => break,
        };

        match result {
            Ok(()) => budget.ok(),
            Err(PcmError::Underrun(device)) => {
                stats.underruns += 1;
                crate::warn_throttled!(throttler, "underrun", "Underrun on {}", device);
            }
            Err(PcmError::Gone(device)) => return Err(BridgeError::DeviceGone(device)),
            Err(e) => budget.fail(e)?,
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
struct ReadStats {
    frames: u64,
    underruns: u64,
    padded: u64,
}

fn read_loop(
    reader: &mut dyn PcmReader,
    queue: &FrameQueue,
    stop: &CancellationToken,
    config: &RelayConfig,
    stats: &mut ReadStats,
) -> Result<(), BridgeError> {
    let throttler = LogThrottler::with_secs(5);
    let mut budget = ErrorBudget::new(RelayStage::Reader, reader.device());
    let mut buf = vec![0u8; config.period_bytes];
    let mut silent_reads = 0u32;

    while !stop.is_cancelled() {
        match reader.read_period(&mut buf) {
            Ok(n) if n > 0 => {
                budget.ok();
                silent_reads = 0;
                stats.frames += 1;

                let frame = if n < buf.len() && config.pad_short_reads {
                    stats.padded += 1;
                    let mut padded = vec![0u8; buf.len()];
                    padded[..n].copy_from_slice(&buf[..n]);
                    Bytes::from(padded)
                } else {
                    Bytes::copy_from_slice(&buf[..n])
                };
                queue.push(frame);
            }
            Ok(_) | Err(PcmError::Timeout(_)) => {
                silent_reads += 1;
                if silent_reads >= config.stall_limit {
                    return Err(BridgeError::Stalled {
                        device: reader.device().to_string(),
                        reads: silent_reads,
                    });
                }
            }
            Err(PcmError::Underrun(device)) => {
                stats.underruns += 1;
                crate::warn_throttled!(throttler, "overrun", "Overrun on {}", device);
            }
            Err(PcmError::Gone(device)) => return Err(BridgeError::DeviceGone(device)),
            Err(e) => budget.fail(e)?,
        }
    }
    Ok(())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Reader → queue → writer relay
pub struct Relay {
    config: RelayConfig,
    cancel: CancellationToken,
}

impl Relay {
    pub fn new(config: RelayConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Run until cancelled or a stage fails, then join both threads.
    ///
    /// Devices are dropped (closed) before this returns.
    pub fn run(self, mut reader: Box<dyn PcmReader>, mut writer: Box<dyn PcmWriter>) -> RelayReport {
        let queue = Arc::new(FrameQueue::new(self.config.queue_capacity));
        // Stops the reader when the writer fails; does not cancel the caller
        let stop = self.cancel.child_token();
        let source = reader.device().to_string();
        let sink = writer.device().to_string();
        info!("Relaying {} -> {}", source, sink);

        let reader_handle = {
            let queue = queue.clone();
            let stop = stop.clone();
            let config = self.config.clone();
            thread::Builder::new()
                .name("relay-reader".to_string())
                .spawn(move || {
                    let mut stats = ReadStats::default();
                    let result = read_loop(reader.as_mut(), &queue, &stop, &config, &mut stats);
                    // The writer drains what is queued, then sees the close
                    queue.close();
                    drop(reader);
                    (result, stats)
                })
        };

        let writer_handle = {
            let queue = queue.clone();
            let stop = stop.clone();
            let silence = vec![0u8; self.config.period_bytes];
            let starve_after = self.config.starve_after;
            thread::Builder::new()
                .name("relay-writer".to_string())
                .spawn(move || {
                    let mut stats = DrainStats::default();
                    let result = drain_queue(
                        &queue,
                        writer.as_mut(),
                        &stop,
                        &silence,
                        starve_after,
                        &mut stats,
                    );
                    if result.is_err() {
                        stop.cancel();
                        queue.close();
                    }
                    drop(writer);
                    (result, stats)
                })
        };

        let (reader_handle, writer_handle) = match (reader_handle, writer_handle) {
            (Ok(r), Ok(w)) => (r, w),
            (r, w) => {
                stop.cancel();
                queue.close();
                if let Ok(h) = r {
                    let _ = h.join();
                }
                if let Ok(h) = w {
                    let _ = h.join();
                }
                return RelayReport {
                    stats: RelayStats::default(),
                    error: Some(BridgeError::Panicked(
                        "failed to spawn relay thread".to_string(),
                    )),
                };
            }
        };

        let (read_result, read_stats) = reader_handle
            .join()
            .unwrap_or_else(|p| (Err(BridgeError::Panicked(panic_message(p))), ReadStats::default()));
        let (write_result, drain_stats) = writer_handle
            .join()
            .unwrap_or_else(|p| (Err(BridgeError::Panicked(panic_message(p))), DrainStats::default()));

        let stats = RelayStats {
            frames_read: read_stats.frames,
            frames_relayed: drain_stats.frames,
            underruns: read_stats.underruns + drain_stats.underruns,
            evicted: queue.stats().evicted,
            silence_inserted: drain_stats.silence,
            short_reads_padded: read_stats.padded,
        };

        // The first stage to fail stops the other; report the reader's
        // failure when both failed since it is usually the cause
        let error = read_result.err().or(write_result.err());
        match &error {
            Some(e) => warn!("Relay {} -> {} stopped: {}", source, sink, e),
            None => debug!("Relay {} -> {} stopped: {:?}", source, sink, stats),
        }

        RelayReport { stats, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::pcm::tests::{RecordingWriter, ScriptedReader};

    fn config() -> RelayConfig {
        RelayConfig {
            period_bytes: 8,
            queue_capacity: 4,
            starve_after: Duration::from_millis(5),
            stall_limit: 1000,
            pad_short_reads: true,
        }
    }

    fn period(tag: u8) -> Result<Vec<u8>, PcmError> {
        Ok(vec![tag; 8])
    }

    #[test]
    fn test_device_gone_stops_relay() {
        let reader = ScriptedReader::new(vec![
            period(1),
            period(2),
            Err(PcmError::Gone("bluealsa".into())),
        ]);
        let writer = RecordingWriter::default();

        let report = Relay::new(config(), CancellationToken::new())
            .run(Box::new(reader), Box::new(writer.clone()));

        assert!(matches!(report.error, Some(BridgeError::DeviceGone(_))));
        assert_eq!(report.stats.frames_read, 2);
        let written = writer.written.lock();
        assert!(written.iter().any(|p| p == &vec![1u8; 8]));
    }

    #[test]
    fn test_three_reader_errors_escalate() {
        let io = || {
            Err(PcmError::Io {
                device: "hw:0,0".into(),
                reason: "EIO".into(),
            })
        };
        let reader = ScriptedReader::new(vec![io(), period(1), io(), io(), io()]);

        let report = Relay::new(config(), CancellationToken::new())
            .run(Box::new(reader), Box::new(RecordingWriter::default()));

        match report.error {
            Some(BridgeError::Escalated { stage, count, .. }) => {
                assert_eq!(stage, RelayStage::Reader);
                assert_eq!(count, 3);
            }
            other => panic!("expected escalation, got {:?}", other),
        }
    }

    #[test]
    fn test_writer_errors_escalate() {
        let reader = ScriptedReader::new((0..50).map(period).collect());
        let writer = RecordingWriter::default();
        for _ in 0..3 {
            writer.failures.lock().push_back(PcmError::Busy("hw:1,0".into()));
        }

        let report = Relay::new(config(), CancellationToken::new())
            .run(Box::new(reader), Box::new(writer));

        assert!(matches!(
            report.error,
            Some(BridgeError::Escalated {
                stage: RelayStage::Writer,
                ..
            })
        ));
    }

    #[test]
    fn test_underruns_are_not_hard_errors() {
        let mut script = Vec::new();
        for _ in 0..5 {
            script.push(Err(PcmError::Underrun("hw:0,0".into())));
        }
        script.push(Err(PcmError::Gone("hw:0,0".into())));

        let report = Relay::new(config(), CancellationToken::new())
            .run(Box::new(ScriptedReader::new(script)), Box::new(RecordingWriter::default()));

        assert!(matches!(report.error, Some(BridgeError::DeviceGone(_))));
        assert_eq!(report.stats.underruns, 5);
    }

    #[test]
    fn test_silent_reads_stall() {
        let mut cfg = config();
        cfg.stall_limit = 5;

        // An exhausted script times out on every read
        let report = Relay::new(cfg, CancellationToken::new()).run(
            Box::new(ScriptedReader::new(vec![period(1)])),
            Box::new(RecordingWriter::default()),
        );

        assert!(matches!(
            report.error,
            Some(BridgeError::Stalled { reads: 5, .. })
        ));
    }

    #[test]
    fn test_starved_writer_inserts_silence_and_cancel_is_clean() {
        let writer = RecordingWriter::default();
        let cancel = CancellationToken::new();
        let relay = Relay::new(config(), cancel.clone());

        let handle = thread::spawn({
            let writer = writer.clone();
            move || relay.run(Box::new(ScriptedReader::new(Vec::new())), Box::new(writer))
        });
        thread::sleep(Duration::from_millis(60));
        cancel.cancel();

        let report = handle.join().unwrap();
        assert!(report.error.is_none());
        assert!(report.stats.silence_inserted > 0);
        assert!(writer.written.lock().iter().all(|p| p == &vec![0u8; 8]));
    }

    #[test]
    fn test_short_reads_are_padded() {
        let reader = ScriptedReader::new(vec![
            Ok(vec![7u8; 2]),
            Err(PcmError::Gone("x".into())),
        ]);
        let writer = RecordingWriter::default();

        let report = Relay::new(config(), CancellationToken::new())
            .run(Box::new(reader), Box::new(writer.clone()));

        assert_eq!(report.stats.short_reads_padded, 1);
        let expected = vec![7u8, 7, 0, 0, 0, 0, 0, 0];
        assert!(writer.written.lock().iter().any(|p| p == &expected));
    }
}
