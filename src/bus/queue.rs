//! Bounded frame queue between the two relay stages
//!
//! Single producer, single consumer. The producer never blocks: at capacity
//! the oldest frame is evicted, because for live audio a late frame is
//! worth less than a fresh one. The consumer blocks for a bounded time.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Hard upper bound on queue capacity
pub const MAX_QUEUE_CAPACITY: usize = 64;

/// Rate correction requested by a latency controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateAdjust {
    #[default]
    None,
    /// Drop the next pushed frame
    Skip,
    /// Enqueue the next pushed frame twice
    Duplicate,
}

/// Result of a bounded pop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop {
    Frame(Bytes),
    Timeout,
    /// Closed and fully drained
    Closed,
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub evicted: u64,
    pub skipped: u64,
    pub duplicated: u64,
}

struct Inner {
    frames: VecDeque<Bytes>,
    pending: RateAdjust,
    closed: bool,
    stats: QueueStats,
}

pub struct FrameQueue {
    inner: Mutex<Inner>,
    available: Condvar,
    capacity: usize,
}

impl FrameQueue {
    /// Capacity is clamped to `1..=MAX_QUEUE_CAPACITY`
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_QUEUE_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                pending: RateAdjust::None,
                closed: false,
                stats: QueueStats::default(),
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a frame, evicting the oldest one when full.
    ///
    /// Returns `false` once the queue is closed.
    pub fn push(&self, frame: Bytes) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }

        // At capacity the push is a plain evict-one-then-append; a pending
        // adjustment is dropped since eviction already bounds the depth
        let pending = std::mem::take(&mut inner.pending);
        if inner.frames.len() >= self.capacity {
            inner.frames.pop_front();
            inner.stats.evicted += 1;
            inner.frames.push_back(frame);
        } else {
            match pending {
                RateAdjust::None => inner.frames.push_back(frame),
                RateAdjust::Skip => inner.stats.skipped += 1,
                RateAdjust::Duplicate if inner.frames.len() + 2 <= self.capacity => {
                    inner.stats.duplicated += 1;
                    inner.frames.push_back(frame.clone());
                    inner.frames.push_back(frame);
                }
                RateAdjust::Duplicate => inner.frames.push_back(frame),
            }
        }
        inner.stats.pushed += 1;
        drop(inner);

        self.available.notify_one();
        true
    }

    /// Dequeue the oldest frame, waiting at most `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(frame) = inner.frames.pop_front() {
                inner.stats.popped += 1;
                return Pop::Frame(frame);
            }
            if inner.closed {
                return Pop::Closed;
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                // A push may have raced the timeout
                return match inner.frames.pop_front() {
                    Some(frame) => {
                        inner.stats.popped += 1;
                        Pop::Frame(frame)
                    }
                    None if inner.closed => Pop::Closed,
                    None => Pop::Timeout,
                };
            }
        }
    }

    /// Request a one-shot rate adjustment, applied on the next push
    pub fn request(&self, adjust: RateAdjust) {
        self.inner.lock().pending = adjust;
    }

    pub fn pending(&self) -> RateAdjust {
        self.inner.lock().pending
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued frame (producer reconnected)
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.frames.clear();
        inner.pending = RateAdjust::None;
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats
    }

    /// Stop accepting frames and wake the consumer
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
