//! Process liveness and process-group signalling
//!
//! Used by the holder registry to pre-empt stale device holders and by the
//! supervisor's conflict scan. The trait seam lets tests substitute a fake
//! process table.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, getpgrp, Pid};
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Poll interval while waiting for a signalled process to exit
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Operations on other processes by pid
pub trait ProcessControl: Send + Sync {
    /// Process exists and is not a zombie
    fn is_alive(&self, pid: i32) -> bool;

    /// Process has exited but was not reaped
    fn is_zombie(&self, pid: i32) -> bool;

    /// Ask the process group of `pid` to exit (SIGTERM)
    fn terminate_group(&self, pid: i32) -> io::Result<()>;

    /// Force-kill the process group of `pid` (SIGKILL)
    fn kill_group(&self, pid: i32) -> io::Result<()>;
}

/// Real implementation over `kill(2)` and `/proc`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

impl SystemProcessControl {
    fn signal_group(&self, pid: i32, signal: Signal) -> io::Result<()> {
        let target = Pid::from_raw(pid);
        let own_group = getpgrp();

        match getpgid(Some(target)) {
            // Never signal our own group; fall back to the single process
            Ok(pgid) if pgid != own_group => {
                debug!("Sending {:?} to process group {}", signal, pgid);
                killpg(pgid, signal).map_err(io::Error::from)
            }
            Ok(_) => kill(target, signal).map_err(io::Error::from),
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

impl ProcessControl for SystemProcessControl {
    fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        let exists = match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        };
        exists && !self.is_zombie(pid)
    }

    fn is_zombie(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| proc_state(&stat))
            .map(|state| state == 'Z')
            .unwrap_or(false)
    }

    fn terminate_group(&self, pid: i32) -> io::Result<()> {
        self.signal_group(pid, Signal::SIGTERM)
    }

    fn kill_group(&self, pid: i32) -> io::Result<()> {
        self.signal_group(pid, Signal::SIGKILL)
    }
}

/// SIGTERM the group of `pid`, wait up to `grace`, then SIGKILL.
///
/// Blocking. Returns `true` if the group had to be force-killed.
pub fn stop_process_group(control: &dyn ProcessControl, pid: i32, grace: Duration) -> bool {
    if let Err(e) = control.terminate_group(pid) {
        warn!("Failed to terminate pid {}: {}", pid, e);
    }
    let deadline = Instant::now() + grace;
    while control.is_alive(pid) && Instant::now() < deadline {
        std::thread::sleep(EXIT_POLL);
    }
    if !control.is_alive(pid) {
        return false;
    }

    warn!("pid {} ignored SIGTERM, killing", pid);
    if let Err(e) = control.kill_group(pid) {
        warn!("Failed to kill pid {}: {}", pid, e);
    }
    true
}

/// Extract the state letter from a `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so the state is the first field after the last `)`.
pub fn proc_state(stat: &str) -> Option<char> {
    let after = &stat[stat.rfind(')')? + 1..];
    after.split_whitespace().next()?.chars().next()
}
