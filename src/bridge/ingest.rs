//! Network stream ingest
//!
//! A producer pushes raw bus-format PCM over TCP. The socket side frames
//! the byte stream into fixed-duration frames and queues them; a drain
//! thread writes them onto the bus main channel at the device clock. The
//! latency controller keeps the queue near its target depth by asking the
//! producer side to drop or repeat a frame.
//!
//! The bus is only held while a producer is connected or frames are still
//! queued, so the Bluetooth sink can write the same channel in between.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::attach::{attach_with_retry, AttachPolicy};
use super::relay::{drain_queue_while, DrainStats};
use super::{open_options, sleep_unless_cancelled, BridgeError, PcmOpener};
use crate::bus::pcm::PcmError;
use crate::bus::queue::{FrameQueue, RateAdjust};
use crate::bus::{BusChannel, BusFormat, LoopbackBus, StreamDirection, StreamSession};
use crate::config::AppConfig;
use crate::registry::HolderRegistry;

const READ_CHUNK: usize = 4096;

/// Steers queue depth toward a target with a hysteresis band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyController {
    pub target: usize,
    pub hysteresis: usize,
}

impl LatencyController {
    pub fn new(target: usize, hysteresis: usize) -> Self {
        Self { target, hysteresis }
    }

    /// Decide the adjustment for the current fill level
    ///
    /// Frames are only duplicated while a producer is connected; an empty
    /// queue with no producer is silence, not lag.
    pub fn decide(&self, fill: usize, producer_connected: bool) -> RateAdjust {
        if fill > self.target + self.hysteresis {
            RateAdjust::Skip
        } else if producer_connected && fill + self.hysteresis < self.target {
            RateAdjust::Duplicate
        } else {
            RateAdjust::None
        }
    }
}

/// Splits a byte stream into fixed-size frames, carrying partial frames
#[derive(Debug)]
pub struct Framer {
    frame_bytes: usize,
    carry: BytesMut,
}

impl Framer {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes: frame_bytes.max(1),
            carry: BytesMut::with_capacity(frame_bytes * 2),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.carry.extend_from_slice(data);
        let mut frames = Vec::with_capacity(self.carry.len() / self.frame_bytes);
        while self.carry.len() >= self.frame_bytes {
            frames.push(self.carry.split_to(self.frame_bytes).freeze());
        }
        frames
    }

    /// Bytes waiting for the rest of their frame
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    pub fn reset(&mut self) {
        self.carry.clear();
    }
}

/// Accepts producer connections and feeds the frame queue
pub struct IngestServer {
    queue: Arc<FrameQueue>,
    frame_bytes: usize,
    controller: LatencyController,
    control_interval: Duration,
    connected: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl IngestServer {
    pub fn new(config: &AppConfig, cancel: CancellationToken) -> Self {
        let latency = &config.latency;
        Self {
            queue: Arc::new(FrameQueue::new(config.ingest.queue_cap)),
            frame_bytes: BusFormat::NATIVE.bytes_for(latency.ingest_frame()),
            controller: LatencyController::new(
                latency.ingest_target_frames,
                latency.ingest_hysteresis_frames,
            ),
            control_interval: Duration::from_millis(config.ingest.control_ms.max(1)),
            connected: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            cancel,
        }
    }

    pub fn queue(&self) -> Arc<FrameQueue> {
        self.queue.clone()
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Shared producer-connected flag, read by the drain thread
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Serve until cancelled; one producer at a time, newest wins
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BridgeError> {
        let controller = self.spawn_controller();
        let mut current: Option<CancellationToken> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Ingest accept failed: {}", e);
                            continue;
                        }
                    };
                    if let Some(previous) = current.take() {
                        info!("New producer {} replaces the previous connection", peer);
                        previous.cancel();
                    } else {
                        info!("Producer connected from {}", peer);
                    }

                    let token = self.cancel.child_token();
                    current = Some(token.clone());
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    self.queue.clear();
                    self.connected.store(true, Ordering::SeqCst);

                    tokio::spawn(Self::read_producer(
                        stream,
                        self.queue.clone(),
                        self.frame_bytes,
                        token,
                        self.connected.clone(),
                        self.generation.clone(),
                        generation,
                    ));
                }
            }
        }

        controller.abort();
        self.queue.close();
        Ok(())
    }

    fn spawn_controller(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let controller = self.controller;
        let connected = self.connected.clone();
        let cancel = self.cancel.clone();
        let period = self.control_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let adjust = controller.decide(queue.len(), connected.load(Ordering::SeqCst));
                        if adjust != RateAdjust::None {
                            debug!("Ingest queue at {} frames, requesting {:?}", queue.len(), adjust);
                        }
                        queue.request(adjust);
                    }
                }
            }
        })
    }

    async fn read_producer(
        mut stream: TcpStream,
        queue: Arc<FrameQueue>,
        frame_bytes: usize,
        cancel: CancellationToken,
        connected: Arc<AtomicBool>,
        current_generation: Arc<AtomicU64>,
        generation: u64,
    ) {
        let mut framer = Framer::new(frame_bytes);
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = stream.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("Producer disconnected");
                        break;
                    }
                    Ok(n) => {
                        for frame in framer.feed(&buf[..n]) {
                            queue.push(frame);
                        }
                    }
                    Err(e) => {
                        warn!("Producer read failed: {}", e);
                        break;
                    }
                }
            }
        }

        if framer.pending() > 0 {
            debug!("Dropping {} bytes of partial frame", framer.pending());
        }
        // A replacement connection owns the flag now
        if current_generation.load(Ordering::SeqCst) == generation {
            connected.store(false, Ordering::SeqCst);
        }
    }
}

/// Run the ingest worker: listener, latency controller and bus drain
///
/// Returns when `cancel` fires or the bus writer fails.
pub async fn run_ingest(
    config: Arc<AppConfig>,
    opener: Arc<dyn PcmOpener>,
    cancel: CancellationToken,
) -> Result<(), BridgeError> {
    let listener = TcpListener::bind(&config.ingest.listen)
        .await
        .map_err(|e| {
            BridgeError::Pcm(PcmError::Io {
                device: config.ingest.listen.clone(),
                reason: format!("bind failed: {}", e),
            })
        })?;
    info!("Ingest listening on {}", config.ingest.listen);

    // Stops the server when the drain fails, without cancelling the caller
    let worker = cancel.child_token();
    let server = IngestServer::new(&config, worker.clone());
    let queue = server.queue();
    let connected = server.connected_flag();
    let silence = vec![0u8; server.frame_bytes()];

    let drain = {
        let config = config.clone();
        let worker = worker.clone();
        tokio::task::spawn_blocking(move || {
            drain_on_demand(&config, opener.as_ref(), &queue, &connected, &silence, &worker)
        })
    };
    tokio::pin!(drain);

    let joined = tokio::select! {
        served = server.serve(listener) => {
            if let Err(e) = served {
                worker.cancel();
                let _ = drain.await;
                return Err(e);
            }
            drain.await
        }
        drained = &mut drain => {
            worker.cancel();
            drained
        }
    };

    match joined {
        Ok(Ok(stats)) => {
            debug!("Ingest drain stopped: {:?}", stats);
            Ok(())
        }
        Ok(Err(BridgeError::Cancelled)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(BridgeError::Panicked(e.to_string())),
    }
}

/// Write queued frames to the bus main channel, holding the device only
/// while there is a producer or a backlog
///
/// A bus held by another writer is logged and retried after the attach
/// backoff; the producer's audio is dropped meanwhile.
fn drain_on_demand(
    config: &AppConfig,
    opener: &dyn PcmOpener,
    queue: &FrameQueue,
    connected: &AtomicBool,
    silence: &[u8],
    stop: &CancellationToken,
) -> Result<DrainStats, BridgeError> {
    let frame = config.latency.ingest_frame();
    let bus = LoopbackBus::new(config.bus.card.clone());
    let device = bus.playback_device(BusChannel::Main);
    let opts = open_options(
        &device,
        StreamDirection::Playback,
        config.latency.hardware_profile(),
        &config.attach,
    );
    let policy = AttachPolicy::from_config(&config.attach);
    let holders = HolderRegistry::new(config.devices.holder_dir.clone());
    let mut stats = DrainStats::default();

    while !stop.is_cancelled() && !queue.is_closed() {
        if !connected.load(Ordering::SeqCst) && queue.is_empty() {
            if !sleep_unless_cancelled(frame, stop) {
                break;
            }
            continue;
        }

        let mut writer = match attach_with_retry(&device, &policy, stop, || opener.open_writer(&opts)) {
            Ok(writer) => writer,
            Err(BridgeError::Cancelled) => break,
            Err(BridgeError::AttachFailed { last, .. }) => {
                warn!("Bus {} unavailable ({}), dropping producer audio", device, last);
                queue.clear();
                if !sleep_unless_cancelled(policy.backoff, stop) {
                    break;
                }
                continue;
            }
            Err(e) => return Err(e),
        };
        // Claimed once open, so a second live claim means a stale writer
        let claim = holders.acquire(StreamSession::new(
            StreamDirection::Playback,
            &device,
            bus.device_key(BusChannel::Main, true),
            config.latency.hardware_profile(),
        ))?;
        info!("Ingest writing to {}", device);

        let result = drain_queue_while(
            queue,
            writer.as_mut(),
            stop,
            silence,
            frame,
            &mut stats,
            || connected.load(Ordering::SeqCst),
        );
        drop(writer);
        if let Err(e) = claim.release() {
            warn!("Failed to release claim on {}: {}", device, e);
        }
        result?;
        if !stop.is_cancelled() && !queue.is_closed() {
            info!("Producer gone, released {}", device);
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::FakeOpener;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_controller_decisions() {
        let c = LatencyController::new(3, 1);
        assert_eq!(c.decide(3, true), RateAdjust::None);
        assert_eq!(c.decide(4, true), RateAdjust::None);
        assert_eq!(c.decide(5, true), RateAdjust::Skip);
        assert_eq!(c.decide(2, true), RateAdjust::None);
        assert_eq!(c.decide(1, true), RateAdjust::Duplicate);
        assert_eq!(c.decide(0, false), RateAdjust::None);
    }

    #[test]
    fn test_framer_carries_partial_frames() {
        let mut framer = Framer::new(4);
        assert!(framer.feed(&[1, 2, 3]).is_empty());
        assert_eq!(framer.pending(), 3);

        let frames = framer.feed(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &[1, 2, 3, 4]);
        assert_eq!(&frames[1][..], &[5, 6, 7, 8]);
        assert_eq!(framer.pending(), 1);

        framer.reset();
        assert_eq!(framer.pending(), 0);
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.latency.ingest_frame_ms = 1; // 192-byte frames
        config.ingest.queue_cap = 10;
        config.ingest.control_ms = 10_000;
        config
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_frames_socket_stream_into_queue() {
        let cancel = CancellationToken::new();
        let server = Arc::new(IngestServer::new(&test_config(), cancel.clone()));
        assert_eq!(server.frame_bytes(), 192);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let mut producer = TcpStream::connect(addr).await.unwrap();
        producer.write_all(&vec![1u8; 192 * 2 + 50]).await.unwrap();
        let queue = server.queue();
        wait_for(|| queue.len() == 2).await;
        assert!(server.is_connected());

        drop(producer);
        wait_for(|| !server.is_connected()).await;

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(queue.is_closed());
    }

    fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    struct DrainFixture {
        _dir: tempfile::TempDir,
        holders: HolderRegistry,
        opener: Arc<FakeOpener>,
        queue: Arc<FrameQueue>,
        connected: Arc<AtomicBool>,
        stop: CancellationToken,
        handle: std::thread::JoinHandle<Result<DrainStats, BridgeError>>,
    }

    fn start_drain(connected: bool, opener: FakeOpener) -> DrainFixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.devices.holder_dir = dir.path().join("holders");
        config.attach.backoff_ms = 1;
        let config = Arc::new(config);

        let opener = Arc::new(opener);
        let queue = Arc::new(FrameQueue::new(10));
        let connected = Arc::new(AtomicBool::new(connected));
        let stop = CancellationToken::new();
        let handle = {
            let (opener, queue, connected, stop) =
                (opener.clone(), queue.clone(), connected.clone(), stop.clone());
            std::thread::spawn(move || {
                drain_on_demand(&config, opener.as_ref(), &queue, &connected, &[0u8; 192], &stop)
            })
        };
        DrainFixture {
            holders: HolderRegistry::new(dir.path().join("holders")),
            _dir: dir,
            opener,
            queue,
            connected,
            stop,
            handle,
        }
    }

    #[test]
    fn test_bus_held_only_while_producer_active() {
        let fx = start_drain(false, FakeOpener::default());

        // No producer: the bus stays free for the Bluetooth sink
        std::thread::sleep(Duration::from_millis(30));
        assert!(fx.opener.opened.lock().is_empty());

        fx.connected.store(true, Ordering::SeqCst);
        fx.queue.push(Bytes::from(vec![7u8; 192]));
        wait_until(|| fx.opener.writer.written.lock().iter().any(|p| p[0] == 7));
        assert_eq!(fx.opener.opened.lock().as_slice(), ["hw:Loopback,0,0"]);
        assert_eq!(fx.holders.claims_for("bus-Loopback-0-0").unwrap().len(), 1);

        fx.connected.store(false, Ordering::SeqCst);
        wait_until(|| fx.holders.claims().unwrap().is_empty());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(fx.opener.opened.lock().len(), 1);

        fx.stop.cancel();
        let stats = fx.handle.join().unwrap().unwrap();
        assert_eq!(stats.frames, 1);
    }

    #[test]
    fn test_busy_bus_is_retried_while_producer_connected() {
        let opener = FakeOpener::default();
        opener
            .writer_failures
            .lock()
            .extend((0..3).map(|_| PcmError::Busy("hw:Loopback,0,0".into())));
        let fx = start_drain(true, opener);
        fx.queue.push(Bytes::from(vec![7u8; 192]));

        wait_until(|| !fx.opener.writer.written.lock().is_empty());
        assert_eq!(fx.opener.opened.lock().len(), 4);
        assert!(!fx.handle.is_finished());

        fx.stop.cancel();
        assert!(fx.handle.join().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_new_connection_replaces_previous() {
        let cancel = CancellationToken::new();
        let server = Arc::new(IngestServer::new(&test_config(), cancel.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(&vec![1u8; 192]).await.unwrap();
        let queue = server.queue();
        wait_for(|| queue.len() == 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(&vec![2u8; 192 * 3]).await.unwrap();
        wait_for(|| queue.len() == 3).await;

        // The replaced connection is closed by the server
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), first.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(server.is_connected());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
