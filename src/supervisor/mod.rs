//! Health supervisor
//!
//! Every poll cycle probes each unit, runs the conflict scan over the holder
//! registry, and restarts units that are down. Restarts are capped: a unit
//! found down `max_restarts` cycles in a row is marked `Down` and left alone
//! until reset or retargeted. An output bridge that exited for an unmapped
//! alias is not restarted until the mapping exists, and a unit that exited
//! with a configuration error waits for the configuration to change. A unit
//! whose writer was terminated by conflict resolution is marked `Down` so two
//! contending units are not restarted against each other forever.

pub mod conflict;
pub mod health_log;
pub mod types;
pub mod unit;

pub use conflict::{ConflictScanner, Finding};
pub use health_log::{HealthBlock, HealthLog, HealthTag};
pub use types::{CycleReport, ServiceHealthRecord, SupervisorCommand, UnitProbe, UnitState};
pub use unit::{build_units, ProcessUnit, SystemdUnit, UnitController};

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ConfigStore};
use crate::error::{EXIT_CONFIG, EXIT_UNKNOWN_ALIAS};
use crate::events::{EventBus, SystemEvent};
use crate::registry::{DeviceRegistry, HolderRegistry, MacAddress};
use crate::utils::process::{ProcessControl, SystemProcessControl};

/// Configuration as seen when a unit exited with a configuration error
struct ConfigStamp {
    config: Arc<AppConfig>,
    modified: Option<SystemTime>,
}

impl ConfigStamp {
    fn capture(store: &ConfigStore) -> Self {
        Self {
            config: store.get(),
            modified: std::fs::metadata(store.path())
                .and_then(|m| m.modified())
                .ok(),
        }
    }

    fn unchanged(&self, now: &ConfigStamp) -> bool {
        Arc::ptr_eq(&self.config, &now.config) && self.modified == now.modified
    }
}

pub struct HealthSupervisor {
    config: ConfigStore,
    units: Vec<Arc<dyn UnitController>>,
    records: HashMap<String, ServiceHealthRecord>,
    /// Units parked on a configuration error
    parked: HashMap<String, ConfigStamp>,
    control: Arc<dyn ProcessControl>,
    events: Arc<EventBus>,
    cycle: u64,
}

impl HealthSupervisor {
    pub fn new(
        config: ConfigStore,
        units: Vec<Arc<dyn UnitController>>,
        events: Arc<EventBus>,
    ) -> Self {
        let records = units
            .iter()
            .map(|u| (u.name().to_string(), ServiceHealthRecord::new(u.name())))
            .collect();
        Self {
            config,
            units,
            records,
            parked: HashMap::new(),
            control: Arc::new(SystemProcessControl),
            events,
            cycle: 0,
        }
    }

    pub fn with_process_control(mut self, control: Arc<dyn ProcessControl>) -> Self {
        self.control = control;
        self
    }

    pub fn record(&self, unit: &str) -> Option<&ServiceHealthRecord> {
        self.records.get(unit)
    }

    /// Records in unit order
    pub fn records(&self) -> Vec<ServiceHealthRecord> {
        self.units
            .iter()
            .filter_map(|u| self.records.get(u.name()).cloned())
            .collect()
    }

    fn set_state(&mut self, unit: &str, to: UnitState) {
        let record = self
            .records
            .entry(unit.to_string())
            .or_insert_with(|| ServiceHealthRecord::new(unit));
        if let Some(from) = record.transition(to) {
            debug!("{}: {} -> {}", unit, from, to);
            self.events.publish(SystemEvent::UnitStateChanged {
                unit: unit.to_string(),
                from,
                to,
            });
        }
    }

    fn record_mut(&mut self, unit: &str) -> &mut ServiceHealthRecord {
        self.records
            .entry(unit.to_string())
            .or_insert_with(|| ServiceHealthRecord::new(unit))
    }

    /// Run one probe / scan / recover cycle and append it to the health log
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let config = self.config.get();
        let sup = &config.supervisor;
        let timeout = sup.command_timeout();
        let mut block = HealthBlock::new(self.cycle);
        let mut report = CycleReport {
            cycle: self.cycle,
            ..Default::default()
        };

        // Liveness
        let probes = join_all(self.units.iter().map(|u| probe_unit(u.clone(), timeout))).await;
        let mut failing = Vec::new();
        let mut writers: HashMap<i32, String> = HashMap::new();
        for (unit, probe) in self.units.clone().iter().zip(probes) {
            let name = unit.name();
            self.record_mut(name).last_checked = Some(Utc::now());

            if self.record_mut(name).state == UnitState::Down {
                block.push(HealthTag::Error, name, "DOWN, awaiting reset");
                continue;
            }
            match probe {
                Ok(probe) if probe.is_running() => {
                    if let Some(pid) = probe.pid() {
                        writers.insert(pid as i32, name.to_string());
                    }
                    self.parked.remove(name);
                    self.record_mut(name).consecutive_failures = 0;
                    self.set_state(name, UnitState::Running);
                    block.push(HealthTag::Ok, name, probe.to_string());
                    report.healthy += 1;
                }
                Ok(probe) => {
                    self.record_mut(name).last_exit_code = probe.exit_code();
                    self.set_state(name, UnitState::Failed);
                    block.push(HealthTag::Fail, name, probe.to_string());
                    failing.push(unit.clone());
                }
                Err(reason) => {
                    self.set_state(name, UnitState::Failed);
                    block.push(HealthTag::Fail, name, format!("probe failed: {}", reason));
                    failing.push(unit.clone());
                }
            }
        }

        // Device contention, independent of unit liveness
        let scanner = ConflictScanner::new(
            HolderRegistry::new(config.devices.holder_dir.clone()),
            self.control.clone(),
            sup.stop_timeout(),
        );
        match tokio::task::spawn_blocking(move || scanner.scan()).await {
            Ok(Ok(findings)) => {
                for finding in findings {
                    if let Finding::Conflict {
                        device_key,
                        terminated,
                        ..
                    } = &finding
                    {
                        report.conflicts += 1;
                        self.events.publish(SystemEvent::ConflictResolved {
                            device_key: device_key.clone(),
                            terminated: terminated.clone(),
                        });
                        block.push(HealthTag::Warn, device_key, finding.to_string());
                        for pid in terminated {
                            if let Some(name) = writers.remove(pid) {
                                self.set_state(&name, UnitState::Down);
                                block.push(
                                    HealthTag::Error,
                                    &name,
                                    format!(
                                        "terminated by conflict resolution on {}, awaiting reset",
                                        device_key
                                    ),
                                );
                                report.healthy = report.healthy.saturating_sub(1);
                                report.down.push(name);
                            }
                        }
                        continue;
                    }
                    block.push(HealthTag::Warn, finding.device_key(), finding.to_string());
                }
            }
            Ok(Err(e)) => block.push(HealthTag::Error, "conflict-scan", e.to_string()),
            Err(e) => block.push(HealthTag::Error, "conflict-scan", format!("panicked: {}", e)),
        }

        // Recovery
        let registry = DeviceRegistry::new(config.devices.mapping_dir.clone());
        let mut restarting = Vec::new();
        for unit in failing {
            let name = unit.name();
            let exit_code = self.record_mut(name).last_exit_code;

            if exit_code == Some(EXIT_CONFIG as i32) {
                let now = ConfigStamp::capture(&self.config);
                let waiting = self
                    .parked
                    .get(name)
                    .map_or(true, |stamp| stamp.unchanged(&now));
                if waiting {
                    self.parked.entry(name.to_string()).or_insert(now);
                    block.push(
                        HealthTag::Error,
                        name,
                        "configuration error (exit 3), waiting for a configuration change",
                    );
                    report.failed += 1;
                    continue;
                }
                self.parked.remove(name);
                info!("{}: configuration changed, restarting", name);
            }

            if exit_code == Some(EXIT_UNKNOWN_ALIAS as i32) {
                if let Some(alias) = unit.alias() {
                    if !registry.contains(alias) {
                        block.push(
                            HealthTag::Error,
                            name,
                            format!("unconfigured: alias {} has no mapping, not restarting", alias),
                        );
                        report.failed += 1;
                        continue;
                    }
                }
            }

            let record = self.record_mut(name);
            record.consecutive_failures += 1;
            let failures = record.consecutive_failures;
            if failures > sup.max_restarts {
                self.set_state(name, UnitState::Down);
                block.push(
                    HealthTag::Error,
                    name,
                    format!("DOWN after {} consecutive failures", sup.max_restarts),
                );
                report.down.push(name.to_string());
                report.failed += 1;
                continue;
            }

            self.set_state(name, UnitState::Recovering);
            restarting.push(unit);
        }

        let settle = sup.settle();
        let outcomes = join_all(
            restarting
                .iter()
                .map(|u| restart_and_check(u.clone(), settle, timeout)),
        )
        .await;
        for (unit, outcome) in restarting.iter().zip(outcomes) {
            let name = unit.name();
            match outcome {
                Ok(probe) if probe.is_running() => {
                    self.set_state(name, UnitState::Running);
                    block.push(HealthTag::Recovered, name, "running after restart");
                    report.recovered.push(name.to_string());
                    report.healthy += 1;
                }
                Ok(probe) => {
                    self.record_mut(name).last_exit_code = probe.exit_code();
                    self.set_state(name, UnitState::Failed);
                    block.push(
                        HealthTag::Error,
                        name,
                        format!("still down after restart: {}", probe),
                    );
                    report.failed += 1;
                }
                Err(reason) => {
                    self.set_state(name, UnitState::Failed);
                    block.push(HealthTag::Error, name, format!("restart failed: {}", reason));
                    report.failed += 1;
                }
            }
        }

        let log = HealthLog::new(sup.health_log.clone(), sup.health_log_max_bytes);
        if let Err(e) = log.append(&block).await {
            warn!("Failed to write health log {}: {}", log.path().display(), e);
            self.events.publish(SystemEvent::SystemError {
                module: "supervisor".to_string(),
                message: format!("health log {}: {}", log.path().display(), e),
            });
        }

        self.events.publish(SystemEvent::CycleCompleted {
            cycle: report.cycle,
            healthy: report.healthy,
            failed: report.failed,
        });
        report
    }

    /// Clear a `Down` unit so the next cycle retries it
    pub fn reset_unit(&mut self, name: &str) -> bool {
        match self.records.get(name) {
            Some(record) if record.state == UnitState::Down => {
                self.clear_record(name);
                info!("Unit {} reset", name);
                true
            }
            _ => false,
        }
    }

    /// Forget failures and parking so the next cycle judges the unit afresh
    fn clear_record(&mut self, name: &str) {
        self.parked.remove(name);
        self.record_mut(name).consecutive_failures = 0;
        self.set_state(name, UnitState::Unknown);
    }

    /// Restart the units that follow the Bluetooth peer
    ///
    /// A restarted unit starts over: `Down` and configuration parking are
    /// cleared along with its failure count.
    pub async fn retarget(&mut self, peer: MacAddress) {
        let timeout = self.config.get().supervisor.command_timeout();
        for unit in self.units.clone() {
            match tokio::time::timeout(timeout, unit.retarget(peer)).await {
                Ok(Ok(true)) => {
                    self.clear_record(unit.name());
                    info!("{} retargeted at {}", unit.name(), peer);
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!("Failed to retarget {}: {}", unit.name(), e),
                Err(_) => warn!("Retargeting {} timed out", unit.name()),
            }
        }
    }

    /// Start owned units, then poll until cancelled
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SupervisorCommand>,
        cancel: CancellationToken,
    ) {
        for unit in &self.units {
            if let Err(e) = unit.launch().await {
                warn!("Failed to start {}: {}", unit.name(), e);
            }
        }

        let (grace, poll) = {
            let config = self.config.get();
            (config.supervisor.grace(), config.supervisor.poll_interval())
        };
        info!(
            "Health supervisor watching {} units, first check in {:?}, then every {:?}",
            self.units.len(),
            grace,
            poll
        );

        let started = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(grace) => true,
        };

        if started {
            let mut ticker = tokio::time::interval(poll.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut commands_open = true;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                    command = commands.recv(), if commands_open => match command {
                        Some(SupervisorCommand::RunNow) => {
                            self.run_cycle().await;
                            ticker.reset();
                        }
                        Some(SupervisorCommand::Retarget(peer)) => self.retarget(peer).await,
                        Some(SupervisorCommand::Reset(name)) => {
                            if !self.reset_unit(&name) {
                                warn!("Unit {} is not down, nothing to reset", name);
                            }
                        }
                        None => commands_open = false,
                    }
                }
            }
        }

        info!("Health supervisor stopping units");
        let results = join_all(self.units.iter().map(|u| u.shutdown())).await;
        for (unit, result) in self.units.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to stop {}: {}", unit.name(), e);
            }
        }
    }
}

async fn probe_unit(unit: Arc<dyn UnitController>, timeout: Duration) -> Result<UnitProbe, String> {
    match tokio::time::timeout(timeout, unit.probe()).await {
        Ok(Ok(probe)) => Ok(probe),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("no answer within {:?}", timeout)),
    }
}

async fn restart_and_check(
    unit: Arc<dyn UnitController>,
    settle: Duration,
    timeout: Duration,
) -> Result<UnitProbe, String> {
    match tokio::time::timeout(timeout, unit.restart()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.to_string()),
        Err(_) => return Err(format!("restart timed out after {:?}", timeout)),
    }
    tokio::time::sleep(settle).await;
    probe_unit(unit, timeout).await
}
