//! Device holder registry
//!
//! Every bridge records "I hold device X" with an explicit acquire before it
//! opens the device and releases the claim when it exits. The supervisor's
//! conflict scan consults these claims instead of pattern-matching process
//! lists.
//!
//! Claims are files `<device-key>@<session-id>.claim` holding the JSON
//! encoded [`StreamSession`], so they are visible across processes and
//! survive a crashed holder long enough to be detected as orphaned.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::RegistryError;
use crate::bus::session::{StreamDirection, StreamSession};
use crate::utils::process::{stop_process_group, ProcessControl};

const CLAIM_EXT: &str = "claim";

/// A claim read back from the registry
#[derive(Debug, Clone)]
pub struct Claim {
    pub path: PathBuf,
    pub session: StreamSession,
}

/// Directory-backed holder registry
#[derive(Debug, Clone)]
pub struct HolderRegistry {
    dir: PathBuf,
}

impl HolderRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn claim_path(&self, session: &StreamSession) -> PathBuf {
        self.dir
            .join(format!("{}@{}.{}", session.device_key, session.id, CLAIM_EXT))
    }

    /// Record a claim on `session.device_key`.
    ///
    /// Does not check for other holders; contention is resolved by
    /// [`acquire_exclusive`](Self::acquire_exclusive) or the supervisor.
    pub fn acquire(&self, session: StreamSession) -> Result<DeviceClaim, RegistryError> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.claim_path(&session);
        let body = serde_json::to_vec(&session)
            .map_err(|e| RegistryError::Claim(format!("encode session: {}", e)))?;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&body)?;
        file.sync_all()?;

        debug!(
            "Acquired {} ({}) for pid {}",
            session.device_key, session.direction, session.pid
        );
        Ok(DeviceClaim {
            path,
            session,
            released: false,
        })
    }

    /// Claim a device after tearing down every other live holder with the
    /// same direction.
    ///
    /// Holders are asked to exit (SIGTERM to their process group) and given
    /// `grace` to release; survivors are force-killed. Their claims are
    /// removed before the new claim is written.
    pub fn acquire_exclusive(
        &self,
        session: StreamSession,
        control: &dyn ProcessControl,
        grace: Duration,
    ) -> Result<DeviceClaim, RegistryError> {
        let rivals: Vec<Claim> = self
            .claims_for(&session.device_key)?
            .into_iter()
            .filter(|c| c.session.direction == session.direction && c.session.pid != session.pid)
            .collect();

        for rival in rivals {
            let pid = rival.session.pid;
            if control.is_alive(pid) {
                info!(
                    "Pre-empting holder pid {} of {} before new attach",
                    pid, session.device_key
                );
                stop_process_group(control, pid, grace);
            }
            self.remove_claim(&rival)?;
        }

        self.acquire(session)
    }

    /// All claims currently recorded
    ///
    /// Unreadable claim files are skipped with a warning.
    pub fn claims(&self) -> Result<Vec<Claim>, RegistryError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RegistryError::Io(e)),
        };

        let mut claims = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CLAIM_EXT) {
                continue;
            }
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                // Released between listing and reading
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(RegistryError::Io(e)),
            };
            match serde_json::from_slice::<StreamSession>(&bytes) {
                Ok(session) => claims.push(Claim { path, session }),
                Err(e) => warn!("Skipping unreadable claim {}: {}", path.display(), e),
            }
        }
        claims.sort_by_key(|c| c.session.started_at);
        Ok(claims)
    }

    /// Claims on one device, oldest first
    pub fn claims_for(&self, device_key: &str) -> Result<Vec<Claim>, RegistryError> {
        Ok(self
            .claims()?
            .into_iter()
            .filter(|c| c.session.device_key == device_key)
            .collect())
    }

    /// Live playback writers on one device
    pub fn writers_for(
        &self,
        device_key: &str,
        control: &dyn ProcessControl,
    ) -> Result<Vec<Claim>, RegistryError> {
        Ok(self
            .claims_for(device_key)?
            .into_iter()
            .filter(|c| c.session.direction == StreamDirection::Playback)
            .filter(|c| control.is_alive(c.session.pid))
            .collect())
    }

    /// Delete a claim file (idempotent)
    pub fn remove_claim(&self, claim: &Claim) -> Result<(), RegistryError> {
        match std::fs::remove_file(&claim.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RegistryError::Io(e)),
        }
    }
}

/// RAII guard for an acquired device; releases the claim on drop
#[derive(Debug)]
pub struct DeviceClaim {
    path: PathBuf,
    session: StreamSession,
    released: bool,
}

impl DeviceClaim {
    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    /// Explicitly release the claim
    pub fn release(mut self) -> Result<(), RegistryError> {
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Released {}", self.session.device_key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RegistryError::Io(e)),
        }
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::pcm::BufferProfile;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// In-memory process table for tests
    #[derive(Default)]
    pub(crate) struct FakeProcesses {
        pub alive: Mutex<HashSet<i32>>,
        pub zombies: Mutex<HashSet<i32>>,
        pub terminated: Mutex<Vec<i32>>,
        pub killed: Mutex<Vec<i32>>,
        /// pids that ignore SIGTERM
        pub stubborn: Mutex<HashSet<i32>>,
    }

    impl FakeProcesses {
        pub fn with_alive(pids: &[i32]) -> Self {
            let fake = Self::default();
            fake.alive.lock().extend(pids.iter().copied());
            fake
        }
    }

    impl ProcessControl for FakeProcesses {
        fn is_alive(&self, pid: i32) -> bool {
            self.alive.lock().contains(&pid) && !self.zombies.lock().contains(&pid)
        }

        fn is_zombie(&self, pid: i32) -> bool {
            self.zombies.lock().contains(&pid)
        }

        fn terminate_group(&self, pid: i32) -> std::io::Result<()> {
            self.terminated.lock().push(pid);
            if !self.stubborn.lock().contains(&pid) {
                self.alive.lock().remove(&pid);
            }
            Ok(())
        }

        fn kill_group(&self, pid: i32) -> std::io::Result<()> {
            self.killed.lock().push(pid);
            self.alive.lock().remove(&pid);
            self.zombies.lock().remove(&pid);
            Ok(())
        }
    }

    pub(crate) fn session(device_key: &str, pid: i32) -> StreamSession {
        StreamSession::new(
            StreamDirection::Playback,
            "plughw:CARD=0,DEV=0",
            device_key,
            BufferProfile::hardware_default(),
        )
        .with_pid(pid)
    }

    #[test]
    fn test_acquire_and_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HolderRegistry::new(dir.path());

        let claim = registry.acquire(session("hw-0-0", 100)).unwrap();
        assert_eq!(registry.claims_for("hw-0-0").unwrap().len(), 1);
        assert_eq!(claim.session().pid, 100);

        drop(claim);
        assert!(registry.claims().unwrap().is_empty());
    }

    #[test]
    fn test_explicit_release() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HolderRegistry::new(dir.path());

        let claim = registry.acquire(session("bt-AABBCCDDEEFF-a2dp", 7)).unwrap();
        claim.release().unwrap();
        assert!(registry.claims().unwrap().is_empty());
    }

    #[test]
    fn test_acquire_exclusive_preempts_prior_holder() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HolderRegistry::new(dir.path());
        let procs = FakeProcesses::with_alive(&[10, 20]);

        let prior = registry.acquire(session("hw-1-0", 10)).unwrap();
        std::mem::forget(prior); // holder is another process

        let _claim = registry
            .acquire_exclusive(session("hw-1-0", 20), &procs, Duration::from_millis(100))
            .unwrap();

        assert_eq!(*procs.terminated.lock(), vec![10]);
        assert!(procs.killed.lock().is_empty());
        let left = registry.claims_for("hw-1-0").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].session.pid, 20);
    }

    #[test]
    fn test_acquire_exclusive_kills_stubborn_holder() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HolderRegistry::new(dir.path());
        let procs = FakeProcesses::with_alive(&[10, 20]);
        procs.stubborn.lock().insert(10);

        std::mem::forget(registry.acquire(session("hw-1-0", 10)).unwrap());
        let _claim = registry
            .acquire_exclusive(session("hw-1-0", 20), &procs, Duration::from_millis(60))
            .unwrap();

        assert_eq!(*procs.killed.lock(), vec![10]);
        assert_eq!(registry.claims_for("hw-1-0").unwrap().len(), 1);
    }

    #[test]
    fn test_writers_ignore_dead_holders() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HolderRegistry::new(dir.path());
        let procs = FakeProcesses::with_alive(&[1]);

        std::mem::forget(registry.acquire(session("hw-0-0", 1)).unwrap());
        std::mem::forget(registry.acquire(session("hw-0-0", 2)).unwrap());

        let writers = registry.writers_for("hw-0-0", &procs).unwrap();
        assert_eq!(writers.len(), 1);
        assert_eq!(writers[0].session.pid, 1);
    }
}
