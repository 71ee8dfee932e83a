//! Single-instance lock
//!
//! A second daemon on the same host would fight the first over the bus and
//! the supervised units, so startup takes an exclusive `flock` and refuses
//! to run when someone else holds it.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Held for the lifetime of the process; unlocked on drop
#[derive(Debug)]
pub struct InstanceLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(AppError::Platform(format!(
                    "another instance holds {}",
                    path.display()
                )))
            }
            Err((_, errno)) => {
                return Err(AppError::Io(std::io::Error::from_raw_os_error(
                    errno as i32,
                )))
            }
        };

        lock.set_len(0)?;
        writeln!(*lock, "{}", std::process::id())?;

        Ok(Self {
            _lock: lock,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
