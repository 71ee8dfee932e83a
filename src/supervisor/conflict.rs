//! Device contention scan over the holder registry
//!
//! A unit can look healthy to its service manager while a stale process
//! still holds its device. The scan finds such holders from the claims
//! bridges record, independently of unit liveness.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::bus::StreamDirection;
use crate::registry::{Claim, HolderRegistry, RegistryError};
use crate::utils::process::{stop_process_group, ProcessControl};

/// Something the scan found and resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// Claim left behind by a process that no longer exists
    Orphan { device_key: String, pid: i32 },
    /// Holder that exited without being reaped
    Zombie { device_key: String, pid: i32 },
    /// More than one live playback writer; older ones were terminated
    Conflict {
        device_key: String,
        kept: i32,
        terminated: Vec<i32>,
    },
}

impl Finding {
    pub fn device_key(&self) -> &str {
        match self {
            Self::Orphan { device_key, .. }
            | Self::Zombie { device_key, .. }
            | Self::Conflict { device_key, .. } => device_key,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Orphan { pid, .. } => write!(f, "orphan claim of dead pid {} removed", pid),
            Self::Zombie { pid, .. } => write!(f, "zombie holder pid {} killed", pid),
            Self::Conflict {
                kept, terminated, ..
            } => write!(
                f,
                "conflict: {} writers, kept pid {}, terminated {:?}",
                terminated.len() + 1,
                kept,
                terminated
            ),
        }
    }
}

#[derive(Clone)]
pub struct ConflictScanner {
    holders: HolderRegistry,
    control: Arc<dyn ProcessControl>,
    grace: Duration,
}

impl ConflictScanner {
    pub fn new(holders: HolderRegistry, control: Arc<dyn ProcessControl>, grace: Duration) -> Self {
        Self {
            holders,
            control,
            grace,
        }
    }

    /// Scan and resolve; blocking, since terminating a holder waits for it
    pub fn scan(&self) -> Result<Vec<Finding>, RegistryError> {
        let mut findings = Vec::new();
        let mut writers: BTreeMap<String, Vec<Claim>> = BTreeMap::new();

        for claim in self.holders.claims()? {
            let pid = claim.session.pid;
            let device_key = claim.session.device_key.clone();

            if self.control.is_zombie(pid) {
                if let Err(e) = self.control.kill_group(pid) {
                    warn!("Failed to kill zombie group {}: {}", pid, e);
                }
                self.holders.remove_claim(&claim)?;
                findings.push(Finding::Zombie { device_key, pid });
            } else if !self.control.is_alive(pid) {
                self.holders.remove_claim(&claim)?;
                findings.push(Finding::Orphan { device_key, pid });
            } else if claim.session.direction == StreamDirection::Playback {
                writers.entry(device_key).or_default().push(claim);
            }
        }

        let own_pid = std::process::id() as i32;
        for (device_key, mut claims) in writers {
            if claims.len() < 2 {
                continue;
            }
            // Claims are oldest first; the newest attach wins
            let Some(newest) = claims.pop() else {
                continue;
            };
            let kept = newest.session.pid;

            let mut terminated = Vec::new();
            for claim in claims {
                let pid = claim.session.pid;
                if pid != kept && pid != own_pid && !terminated.contains(&pid) {
                    stop_process_group(self.control.as_ref(), pid, self.grace);
                    terminated.push(pid);
                }
                self.holders.remove_claim(&claim)?;
            }
            findings.push(Finding::Conflict {
                device_key,
                kept,
                terminated,
            });
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::holders::tests::{session, FakeProcesses};

    fn scanner(dir: &std::path::Path, procs: Arc<FakeProcesses>) -> ConflictScanner {
        ConflictScanner::new(HolderRegistry::new(dir), procs, Duration::from_millis(10))
    }

    #[test]
    fn test_two_writers_reduced_to_newest() {
        let dir = tempfile::tempdir().unwrap();
        let holders = HolderRegistry::new(dir.path());
        let older = holders.acquire(session("hw-0-0", 100)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let newer = holders.acquire(session("hw-0-0", 200)).unwrap();
        std::mem::forget(older);
        std::mem::forget(newer);

        let procs = Arc::new(FakeProcesses::with_alive(&[100, 200]));
        let findings = scanner(dir.path(), procs.clone()).scan().unwrap();

        assert_eq!(
            findings,
            vec![Finding::Conflict {
                device_key: "hw-0-0".into(),
                kept: 200,
                terminated: vec![100],
            }]
        );
        assert_eq!(*procs.terminated.lock(), vec![100]);
        let left = holders.claims_for("hw-0-0").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].session.pid, 200);

        // Second pass finds nothing
        assert!(scanner(dir.path(), procs).scan().unwrap().is_empty());
    }

    #[test]
    fn test_stubborn_writer_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let holders = HolderRegistry::new(dir.path());
        std::mem::forget(holders.acquire(session("hw-1-0", 300)).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        std::mem::forget(holders.acquire(session("hw-1-0", 400)).unwrap());

        let procs = Arc::new(FakeProcesses::with_alive(&[300, 400]));
        procs.stubborn.lock().insert(300);
        scanner(dir.path(), procs.clone()).scan().unwrap();

        assert_eq!(*procs.killed.lock(), vec![300]);
    }

    #[test]
    fn test_orphans_and_zombies_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let holders = HolderRegistry::new(dir.path());
        std::mem::forget(holders.acquire(session("hw-0-0", 10)).unwrap());
        std::mem::forget(holders.acquire(session("bt-aabbccddeeff-a2dp", 20)).unwrap());

        let procs = Arc::new(FakeProcesses::with_alive(&[20]));
        procs.zombies.lock().insert(20);
        let mut findings = scanner(dir.path(), procs.clone()).scan().unwrap();
        findings.sort_by_key(|f| f.device_key().to_string());

        assert_eq!(
            findings,
            vec![
                Finding::Zombie {
                    device_key: "bt-aabbccddeeff-a2dp".into(),
                    pid: 20
                },
                Finding::Orphan {
                    device_key: "hw-0-0".into(),
                    pid: 10
                },
            ]
        );
        assert_eq!(*procs.killed.lock(), vec![20]);
        assert!(holders.claims().unwrap().is_empty());
    }

    #[test]
    fn test_capture_claims_are_not_writers() {
        let dir = tempfile::tempdir().unwrap();
        let holders = HolderRegistry::new(dir.path());
        let mut a = session("bus-Loopback-1-0", 1);
        a.direction = StreamDirection::Capture;
        let mut b = session("bus-Loopback-1-0", 2);
        b.direction = StreamDirection::Capture;
        std::mem::forget(holders.acquire(a).unwrap());
        std::mem::forget(holders.acquire(b).unwrap());

        let procs = Arc::new(FakeProcesses::with_alive(&[1, 2]));
        assert!(scanner(dir.path(), procs).scan().unwrap().is_empty());
    }
}
