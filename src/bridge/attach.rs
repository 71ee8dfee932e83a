//! Bounded attach retry
//!
//! BlueALSA only exposes a PCM once the A2DP profile is negotiated, and a
//! device released by a previous holder can stay busy for a moment. Opens
//! are therefore retried a fixed number of times with a fixed backoff.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{sleep_unless_cancelled, BridgeError};
use crate::bus::pcm::PcmError;
use crate::config::AttachConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    /// Also retry generic I/O errors (Bluetooth targets, where the profile
    /// may still be negotiating)
    pub retry_io: bool,
}

impl AttachPolicy {
    pub fn from_config(config: &AttachConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            backoff: config.backoff(),
            retry_io: false,
        }
    }

    pub fn with_retry_io(mut self, retry_io: bool) -> Self {
        self.retry_io = retry_io;
        self
    }

    fn retries(&self, err: &PcmError) -> bool {
        err.is_transient() || (self.retry_io && matches!(err, PcmError::Io { .. }))
    }
}

impl Default for AttachPolicy {
    fn default() -> Self {
        Self::from_config(&AttachConfig::default())
    }
}

/// Call `open` until it succeeds, a non-retryable error occurs, attempts run
/// out, or `cancel` fires
pub fn attach_with_retry<T, F>(
    device: &str,
    policy: &AttachPolicy,
    cancel: &CancellationToken,
    mut open: F,
) -> Result<T, BridgeError>
where
    F: FnMut() -> Result<T, PcmError>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        match open() {
            Ok(endpoint) => {
                if attempt > 1 {
                    info!("Attached {} on attempt {}", device, attempt);
                }
                return Ok(endpoint);
            }
            Err(e) if !policy.retries(&e) => return Err(BridgeError::Pcm(e)),
            Err(e) if attempt >= attempts => {
                return Err(BridgeError::AttachFailed {
                    device: device.to_string(),
                    attempts,
                    last: e,
                })
            }
            Err(e) => {
                warn!(
                    "Attach {} failed (attempt {}/{}): {}, retrying in {:?}",
                    device, attempt, attempts, e, policy.backoff
                );
                if !sleep_unless_cancelled(policy.backoff, cancel) {
                    return Err(BridgeError::Cancelled);
                }
                attempt += 1;
            }
        }
    }
}
