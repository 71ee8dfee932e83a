//! Supervised units
//!
//! A unit is either a systemd service queried through `systemctl`, or a
//! worker process the supervisor spawns itself (output bridges, the network
//! ingest, the Bluetooth bridge when it is not a systemd service).

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::UnitProbe;
use crate::config::{AppConfig, UnitSpec};
use crate::error::{AppError, Result};
use crate::registry::{DeviceAlias, MacAddress};
use crate::utils::process::{ProcessControl, SystemProcessControl};

/// Maximum number of log lines kept per worker
const LOG_BUFFER_SIZE: usize = 200;

/// Control surface the supervisor needs from a unit
#[async_trait]
pub trait UnitController: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self) -> Result<UnitProbe>;

    async fn restart(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Start if not started yet; units managed elsewhere do nothing
    async fn launch(&self) -> Result<()> {
        Ok(())
    }

    /// Stop on supervisor exit; units managed elsewhere keep running
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Alias an output bridge unit is bound to
    fn alias(&self) -> Option<&DeviceAlias> {
        None
    }

    /// Point the unit at a new Bluetooth peer; returns whether it follows
    /// the peer (and was restarted)
    async fn retarget(&self, _peer: MacAddress) -> Result<bool> {
        Ok(false)
    }
}

/// A systemd service
pub struct SystemdUnit {
    name: String,
    timeout: Duration,
    follows_peer: bool,
}

impl SystemdUnit {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
            follows_peer: false,
        }
    }

    pub fn following_peer(mut self, follows: bool) -> Self {
        self.follows_peer = follows;
        self
    }

    async fn systemctl(&self, args: &[&str]) -> Result<String> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("systemctl")
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            AppError::Supervisor(format!(
                "systemctl {} timed out after {:?}",
                args.join(" "),
                self.timeout
            ))
        })??;

        if !output.status.success() {
            return Err(AppError::Supervisor(format!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl UnitController for SystemdUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<UnitProbe> {
        let text = self
            .systemctl(&[
                "show",
                "-p",
                "ActiveState",
                "-p",
                "MainPID",
                "-p",
                "ExecMainStatus",
                &self.name,
            ])
            .await?;
        Ok(parse_systemctl_show(&text))
    }

    async fn restart(&self) -> Result<()> {
        info!("Restarting systemd unit {}", self.name);
        self.systemctl(&["restart", &self.name]).await.map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        self.systemctl(&["stop", &self.name]).await.map(|_| ())
    }

    async fn retarget(&self, peer: MacAddress) -> Result<bool> {
        if !self.follows_peer {
            return Ok(false);
        }
        info!("Retargeting {} at {}", self.name, peer);
        self.restart().await?;
        Ok(true)
    }
}

/// Map `systemctl show` output to a probe result
pub fn parse_systemctl_show(text: &str) -> UnitProbe {
    let props: HashMap<&str, &str> = text
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let pid = props
        .get("MainPID")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|pid| *pid > 0);
    let code = props
        .get("ExecMainStatus")
        .and_then(|v| v.parse::<i32>().ok());

    match props.get("ActiveState").copied().unwrap_or("unknown") {
        "active" | "activating" | "reloading" => UnitProbe::Active { pid },
        "failed" => UnitProbe::Exited { code },
        _ => match code {
            Some(c) if c != 0 => UnitProbe::Exited { code: Some(c) },
            _ => UnitProbe::Inactive,
        },
    }
}

/// A worker process owned by the supervisor
///
/// The worker runs in its own process group so stopping it also stops
/// anything it spawned.
pub struct ProcessUnit {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    alias: Option<DeviceAlias>,
    follows_peer: bool,
    stop_timeout: Duration,
    control: Arc<dyn ProcessControl>,
    child: Mutex<Option<Child>>,
    logs: Arc<parking_lot::Mutex<VecDeque<String>>>,
}

impl ProcessUnit {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            alias: None,
            follows_peer: false,
            stop_timeout: Duration::from_secs(3),
            control: Arc::new(SystemProcessControl),
            child: Mutex::new(None),
            logs: Arc::new(parking_lot::Mutex::new(VecDeque::with_capacity(
                LOG_BUFFER_SIZE,
            ))),
        }
    }

    pub fn with_alias(mut self, alias: DeviceAlias) -> Self {
        self.alias = Some(alias);
        self
    }

    pub fn following_peer(mut self, follows: bool) -> Self {
        self.follows_peer = follows;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Most recent output lines of the worker
    pub fn logs(&self, lines: usize) -> Vec<String> {
        let logs = self.logs.lock();
        let start = logs.len().saturating_sub(lines);
        logs.range(start..).cloned().collect()
    }

    fn spawn(&self, slot: &mut Option<Child>) -> Result<()> {
        info!(
            "Starting {}: {} {}",
            self.name,
            self.program.display(),
            self.args.join(" ")
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Supervisor(format!("failed to start {}: {}", self.name, e)))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(collect_logs(self.name.clone(), stdout, self.logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(collect_logs(self.name.clone(), stderr, self.logs.clone()));
        }

        info!("{} started with PID {:?}", self.name, child.id());
        *slot = Some(child);
        Ok(())
    }

    /// SIGTERM the group, wait, then SIGKILL
    async fn stop_child(&self, slot: &mut Option<Child>) {
        let Some(mut child) = slot.take() else {
            return;
        };
        if let Ok(Some(status)) = child.try_wait() {
            debug!("{} already exited: {}", self.name, status);
            return;
        }
        let Some(pid) = child.id() else {
            return;
        };

        info!("Stopping {} (pid {})", self.name, pid);
        if let Err(e) = self.control.terminate_group(pid as i32) {
            warn!("Failed to signal {}: {}", self.name, e);
        }
        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!("{} exited: {}", self.name, status),
            Ok(Err(e)) => warn!("Failed to wait for {}: {}", self.name, e),
            Err(_) => {
                warn!(
                    "{} ignored SIGTERM for {:?}, killing",
                    self.name, self.stop_timeout
                );
                if let Err(e) = self.control.kill_group(pid as i32) {
                    warn!("Failed to kill {}: {}", self.name, e);
                }
                if let Err(e) = child.kill().await {
                    debug!("Kill {}: {}", self.name, e);
                }
            }
        }
    }
}

#[async_trait]
impl UnitController for ProcessUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<UnitProbe> {
        let mut slot = self.child.lock().await;
        match slot.as_mut() {
            None => Ok(UnitProbe::Inactive),
            Some(child) => match child.try_wait()? {
                Some(status) => Ok(UnitProbe::Exited {
                    code: status.code(),
                }),
                None => Ok(UnitProbe::Active { pid: child.id() }),
            },
        }
    }

    async fn restart(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        self.stop_child(&mut slot).await;
        self.spawn(&mut slot)
    }

    async fn stop(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        self.stop_child(&mut slot).await;
        Ok(())
    }

    async fn launch(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        if slot.is_none() {
            self.spawn(&mut slot)?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop().await
    }

    fn alias(&self) -> Option<&DeviceAlias> {
        self.alias.as_ref()
    }

    async fn retarget(&self, peer: MacAddress) -> Result<bool> {
        if !self.follows_peer {
            return Ok(false);
        }
        info!("Retargeting {} at {}", self.name, peer);
        self.restart().await?;
        Ok(true)
    }
}

async fn collect_logs<R: tokio::io::AsyncRead + Unpin>(
    name: String,
    reader: R,
    logs: Arc<parking_lot::Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!("[{}] {}", name, line);
                let mut logs = logs.lock();
                if logs.len() >= LOG_BUFFER_SIZE {
                    logs.pop_front();
                }
                logs.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("[{}] Error reading log: {}", name, e);
                break;
            }
        }
    }
}

/// Build the configured units
///
/// Workers are this program's own subcommands (and the sibling `bridge`
/// binary), started with the same configuration file.
pub fn build_units(
    config: &AppConfig,
    config_path: &Path,
    program: &Path,
) -> Vec<Arc<dyn UnitController>> {
    let sup = &config.supervisor;
    let timeout = sup.command_timeout();
    let base_args = || vec!["--config".to_string(), config_path.display().to_string()];

    sup.units
        .iter()
        .map(|spec| -> Arc<dyn UnitController> {
            match spec {
                UnitSpec::Systemd(name) => {
                    let follows = sup.bt_source_unit.as_deref() == Some(name.as_str());
                    Arc::new(SystemdUnit::new(name.clone(), timeout).following_peer(follows))
                }
                UnitSpec::Bridge(alias) => {
                    let mut args = base_args();
                    args.push(alias.to_string());
                    Arc::new(
                        ProcessUnit::new(spec.to_string(), program.with_file_name("bridge"), args)
                            .with_alias(alias.clone())
                            .with_stop_timeout(sup.stop_timeout()),
                    )
                }
                UnitSpec::Ingest => {
                    let mut args = base_args();
                    args.push("ingest".to_string());
                    Arc::new(
                        ProcessUnit::new(spec.to_string(), program, args)
                            .with_stop_timeout(sup.stop_timeout()),
                    )
                }
                UnitSpec::BtSource => match &sup.bt_source_unit {
                    Some(name) => {
                        Arc::new(SystemdUnit::new(name.clone(), timeout).following_peer(true))
                    }
                    None => {
                        let mut args = base_args();
                        args.push("bt-source".to_string());
                        Arc::new(
                            ProcessUnit::new(spec.to_string(), program, args)
                                .following_peer(true)
                                .with_stop_timeout(sup.stop_timeout()),
                        )
                    }
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_systemctl_show() {
        let active = "ActiveState=active\nMainPID=812\nExecMainStatus=0\n";
        assert_eq!(
            parse_systemctl_show(active),
            UnitProbe::Active { pid: Some(812) }
        );

        let failed = "ActiveState=failed\nMainPID=0\nExecMainStatus=2\n";
        assert_eq!(
            parse_systemctl_show(failed),
            UnitProbe::Exited { code: Some(2) }
        );

        let stopped = "ActiveState=inactive\nMainPID=0\nExecMainStatus=0\n";
        assert_eq!(parse_systemctl_show(stopped), UnitProbe::Inactive);

        assert_eq!(parse_systemctl_show(""), UnitProbe::Inactive);
    }

    #[test]
    fn test_build_units() {
        let mut config = AppConfig::default();
        config.supervisor.units = vec![
            UnitSpec::Systemd("bluealsa".into()),
            UnitSpec::Bridge(DeviceAlias::new("DAC").unwrap()),
            UnitSpec::Ingest,
            UnitSpec::BtSource,
        ];
        let units = build_units(
            &config,
            Path::new("/etc/audio-router/router.conf"),
            Path::new("/usr/bin/audio-router"),
        );
        let names: Vec<&str> = units.iter().map(|u| u.name()).collect();
        assert_eq!(names, vec!["bluealsa", "bridge:DAC", "ingest", "bt-source"]);
        assert_eq!(units[1].alias().map(|a| a.as_str()), Some("DAC"));
        assert!(units[2].alias().is_none());
    }

    #[tokio::test]
    async fn test_process_unit_lifecycle() {
        let unit = ProcessUnit::new("sleeper", "sleep", vec!["30".to_string()])
            .with_stop_timeout(Duration::from_secs(2));
        assert_eq!(unit.probe().await.unwrap(), UnitProbe::Inactive);

        unit.launch().await.unwrap();
        assert!(unit.probe().await.unwrap().is_running());

        unit.stop().await.unwrap();
        assert_eq!(unit.probe().await.unwrap(), UnitProbe::Inactive);
    }

    #[tokio::test]
    async fn test_process_unit_reports_exit_code_and_output() {
        let unit = ProcessUnit::new(
            "worker",
            "sh",
            vec!["-c".to_string(), "echo starting; exit 2".to_string()],
        );
        unit.launch().await.unwrap();

        let mut probe = unit.probe().await.unwrap();
        for _ in 0..200 {
            if !probe.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            probe = unit.probe().await.unwrap();
        }
        assert_eq!(probe, UnitProbe::Exited { code: Some(2) });

        // The collector may lag the exit slightly
        for _ in 0..100 {
            if !unit.logs(10).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(unit.logs(10), vec!["starting".to_string()]);
    }
}
