//! Log throttling
//!
//! Device errors tend to repeat every period (a dead monitor sub-channel,
//! a flapping Bluetooth link). The throttler lets the first occurrence
//! through and suppresses the rest for an interval.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits how often the same message key is logged
pub struct LogThrottler {
    last_logged: Mutex<HashMap<String, Instant>>,
    /// Number of messages suppressed per key since it was last logged
    suppressed: Mutex<HashMap<String, u64>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            suppressed: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` if a message for `key` should be logged now
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        if let Some(last) = map.get(key) {
            if now.duration_since(*last) < self.interval {
                *self.suppressed.lock().entry(key.to_string()).or_insert(0) += 1;
                return false;
            }
        }
        map.insert(key.to_string(), now);
        true
    }

    /// Take the suppressed count for `key`, resetting it
    pub fn take_suppressed(&self, key: &str) -> u64 {
        self.suppressed.lock().remove(key).unwrap_or(0)
    }

    /// Forget `key` so the next occurrence is logged immediately
    ///
    /// Call when the error condition recovers.
    pub fn clear(&self, key: &str) {
        self.last_logged.lock().remove(key);
        self.suppressed.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.last_logged.lock().clear();
        self.suppressed.lock().clear();
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

/// Throttled `tracing::error!`
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::error!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("underrun"));
        assert!(!throttler.should_log("underrun"));
        assert!(!throttler.should_log("underrun"));
        assert_eq!(throttler.take_suppressed("underrun"), 2);
        assert_eq!(throttler.take_suppressed("underrun"), 0);

        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("underrun"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("main"));
        assert!(throttler.should_log("mirror"));
        assert!(!throttler.should_log("main"));
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("gone"));
        assert!(!throttler.should_log("gone"));
        throttler.clear("gone");
        assert!(throttler.should_log("gone"));

        throttler.clear_all();
        assert!(throttler.should_log("gone"));
    }
}
