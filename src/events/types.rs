//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::registry::MacAddress;
use crate::supervisor::UnitState;

/// System event enumeration
///
/// Serialized as:
/// ```json
/// {
///   "event": "pairing.service_authorized",
///   "data": { "address": "AA:BB:CC:DD:EE:FF", "uuid": "0000110d-..." }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    // ============================================================================
    // Pairing Events
    // ============================================================================
    /// A device completed pairing (passkey confirmed)
    #[serde(rename = "pairing.device_paired")]
    DevicePaired {
        address: MacAddress,
        /// Passkey shown during confirmation, if any
        passkey: Option<u32>,
    },

    /// A paired device was authorized for a service
    #[serde(rename = "pairing.service_authorized")]
    ServiceAuthorized { address: MacAddress, uuid: String },

    /// bluetoothd unregistered the agent
    #[serde(rename = "pairing.agent_released")]
    AgentReleased,

    /// A pairing request was cancelled by the remote or by bluetoothd
    #[serde(rename = "pairing.cancelled")]
    PairingCancelled,

    // ============================================================================
    // Routing Events
    // ============================================================================
    /// The peer alias now points at a new Bluetooth device
    #[serde(rename = "routing.peer_changed")]
    PeerChanged {
        address: MacAddress,
        alias: String,
    },

    // ============================================================================
    // Supervisor Events
    // ============================================================================
    /// Unit health state transition
    #[serde(rename = "supervisor.unit_state_changed")]
    UnitStateChanged {
        unit: String,
        from: UnitState,
        to: UnitState,
    },

    /// Conflict scan terminated older writers on a device
    #[serde(rename = "supervisor.conflict_resolved")]
    ConflictResolved {
        device_key: String,
        terminated: Vec<i32>,
    },

    /// One health cycle completed
    #[serde(rename = "supervisor.cycle_completed")]
    CycleCompleted {
        cycle: u64,
        healthy: usize,
        failed: usize,
    },

    // ============================================================================
    // System Events
    // ============================================================================
    #[serde(rename = "system.error")]
    SystemError { module: String, message: String },
}

impl SystemEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::DevicePaired { .. } => "pairing.device_paired",
            Self::ServiceAuthorized { .. } => "pairing.service_authorized",
            Self::AgentReleased => "pairing.agent_released",
            Self::PairingCancelled => "pairing.cancelled",
            Self::PeerChanged { .. } => "routing.peer_changed",
            Self::UnitStateChanged { .. } => "supervisor.unit_state_changed",
            Self::ConflictResolved { .. } => "supervisor.conflict_resolved",
            Self::CycleCompleted { .. } => "supervisor.cycle_completed",
            Self::SystemError { .. } => "system.error",
        }
    }

    /// Check if event matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `pairing.*` matches all pairing events
    /// - `supervisor.unit_state_changed` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            return event_name.starts_with(prefix)
                && event_name.as_bytes().get(prefix.len()) == Some(&b'.');
        }

        event_name == topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddress {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    #[test]
    fn test_event_name() {
        let event = SystemEvent::ServiceAuthorized {
            address: mac(),
            uuid: "0000110d-0000-1000-8000-00805f9b34fb".to_string(),
        };
        assert_eq!(event.event_name(), "pairing.service_authorized");
    }

    #[test]
    fn test_matches_topic() {
        let event = SystemEvent::DevicePaired {
            address: mac(),
            passkey: Some(123456),
        };

        assert!(event.matches_topic("*"));
        assert!(event.matches_topic("pairing.*"));
        assert!(event.matches_topic("pairing.device_paired"));
        assert!(!event.matches_topic("supervisor.*"));
        assert!(!event.matches_topic("pair.*"));
    }

    #[test]
    fn test_serialization() {
        let event = SystemEvent::UnitStateChanged {
            unit: "bridge:BT_FOSI".to_string(),
            from: UnitState::Running,
            to: UnitState::Failed,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("supervisor.unit_state_changed"));
        assert!(json.contains("\"to\":\"failed\""));

        let back: SystemEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
