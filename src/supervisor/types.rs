//! Supervisor types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::registry::MacAddress;

/// Health state of a supervised unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    #[default]
    Unknown,
    Running,
    Failed,
    Recovering,
    /// Restart cap reached; left alone until reset
    Down,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Recovering => "recovering",
            Self::Down => "down",
        };
        f.write_str(s)
    }
}

/// Result of one liveness query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitProbe {
    Active { pid: Option<u32> },
    Inactive,
    Exited { code: Option<i32> },
}

impl UnitProbe {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { code } => *code,
            _ => None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Active { pid } => *pid,
            _ => None,
        }
    }
}

impl fmt::Display for UnitProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active { pid: Some(pid) } => write!(f, "active (pid {})", pid),
            Self::Active { pid: None } => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Exited { code: Some(code) } => write!(f, "exited with code {}", code),
            Self::Exited { code: None } => write!(f, "killed by signal"),
        }
    }
}

/// Per-unit health bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealthRecord {
    pub unit: String,
    pub last_checked: Option<DateTime<Utc>>,
    pub state: UnitState,
    /// Cycles in a row the unit was found not running
    pub consecutive_failures: u32,
    pub last_exit_code: Option<i32>,
}

impl ServiceHealthRecord {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            last_checked: None,
            state: UnitState::Unknown,
            consecutive_failures: 0,
            last_exit_code: None,
        }
    }

    /// Move to `to`; returns the previous state when it changed
    pub fn transition(&mut self, to: UnitState) -> Option<UnitState> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        Some(from)
    }
}

/// Requests sent to a running supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Run a cycle now instead of waiting for the next tick
    RunNow,
    /// A new Bluetooth peer was recorded; restart units that follow it
    Retarget(MacAddress),
    /// Clear a unit's `Down` state so it is retried again
    Reset(String),
}

/// Outcome of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub healthy: usize,
    pub failed: usize,
    pub recovered: Vec<String>,
    pub down: Vec<String>,
    pub conflicts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_reports_changes_only() {
        let mut record = ServiceHealthRecord::new("ingest");
        assert_eq!(record.transition(UnitState::Running), Some(UnitState::Unknown));
        assert_eq!(record.transition(UnitState::Running), None);
        assert_eq!(record.transition(UnitState::Failed), Some(UnitState::Running));
    }

    #[test]
    fn test_probe_display() {
        assert_eq!(UnitProbe::Active { pid: Some(7) }.to_string(), "active (pid 7)");
        assert_eq!(
            UnitProbe::Exited { code: Some(2) }.to_string(),
            "exited with code 2"
        );
        assert_eq!(UnitProbe::Exited { code: Some(2) }.exit_code(), Some(2));
        assert!(!UnitProbe::Inactive.is_running());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&UnitState::Recovering).unwrap(),
            "\"recovering\""
        );
    }
}
