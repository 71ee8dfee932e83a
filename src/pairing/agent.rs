//! Auto-accept pairing agent

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::events::{EventBus, SystemEvent};
use crate::registry::MacAddress;

/// Short UUIDs of the A2DP services (source, sink, distribution)
const AUDIO_SERVICES: [u32; 3] = [0x110a, 0x110b, 0x110d];

/// Bluetooth base UUID after the 32-bit short form
const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

#[derive(Error, Debug)]
pub enum PairingError {
    #[error("bluetoothd error: {0}")]
    Bluez(String),
}

/// The four hooks bluetoothd invokes on a registered agent
#[async_trait]
pub trait PairingAgent: Send + Sync {
    /// bluetoothd unregistered the agent
    async fn release(&self);

    async fn confirm_pairing(
        &self,
        device: MacAddress,
        passkey: Option<u32>,
    ) -> Result<(), PairingError>;

    async fn authorize_service(&self, device: MacAddress, uuid: &str) -> Result<(), PairingError>;

    /// A pending request was cancelled
    async fn cancel(&self);
}

/// Accepts every request without interaction and reports it on the event bus
pub struct AutoAcceptAgent {
    events: Arc<EventBus>,
}

impl AutoAcceptAgent {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl PairingAgent for AutoAcceptAgent {
    async fn release(&self) {
        info!("Pairing agent released");
        self.events.publish(SystemEvent::AgentReleased);
    }

    async fn confirm_pairing(
        &self,
        device: MacAddress,
        passkey: Option<u32>,
    ) -> Result<(), PairingError> {
        match passkey {
            Some(passkey) => info!("Accepting pairing with {} (passkey {:06})", device, passkey),
            None => info!("Accepting pairing with {}", device),
        }
        self.events.publish(SystemEvent::DevicePaired {
            address: device,
            passkey,
        });
        Ok(())
    }

    async fn authorize_service(&self, device: MacAddress, uuid: &str) -> Result<(), PairingError> {
        debug!("Authorizing service {} for {}", uuid, device);
        self.events.publish(SystemEvent::ServiceAuthorized {
            address: device,
            uuid: uuid.to_string(),
        });
        Ok(())
    }

    async fn cancel(&self) {
        info!("Pairing request cancelled");
        self.events.publish(SystemEvent::PairingCancelled);
    }
}

/// Whether a service UUID (full or short form) is an A2DP audio service
pub fn is_audio_uuid(uuid: &str) -> bool {
    let uuid = uuid.trim().to_ascii_lowercase();
    let short = match uuid.strip_suffix(BASE_UUID_SUFFIX) {
        Some(prefix) => u32::from_str_radix(prefix, 16).ok(),
        None if uuid.len() <= 10 => u32::from_str_radix(uuid.trim_start_matches("0x"), 16).ok(),
        None => None,
    };
    short.map(|s| AUDIO_SERVICES.contains(&s)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_uuids() {
        assert!(is_audio_uuid("0000110b-0000-1000-8000-00805f9b34fb"));
        assert!(is_audio_uuid("0000110A-0000-1000-8000-00805F9B34FB"));
        assert!(is_audio_uuid("0x110d"));
        assert!(is_audio_uuid("110b"));
        assert!(!is_audio_uuid("00001124-0000-1000-8000-00805f9b34fb"));
        assert!(!is_audio_uuid("0000110b-1111-2222-3333-444455556666"));
        assert!(!is_audio_uuid("garbage"));
    }

    #[tokio::test]
    async fn test_auto_accept_publishes_events() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let agent = AutoAcceptAgent::new(events.clone());
        let device: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();

        tokio_test::assert_ok!(agent.confirm_pairing(device, Some(123456)).await);
        tokio_test::assert_ok!(
            agent
                .authorize_service(device, "0000110b-0000-1000-8000-00805f9b34fb")
                .await
        );
        agent.cancel().await;
        agent.release().await;

        assert_eq!(
            rx.recv().await.unwrap(),
            SystemEvent::DevicePaired {
                address: device,
                passkey: Some(123456)
            }
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            SystemEvent::ServiceAuthorized { .. }
        ));
        assert_eq!(rx.recv().await.unwrap(), SystemEvent::PairingCancelled);
        assert_eq!(rx.recv().await.unwrap(), SystemEvent::AgentReleased);
    }
}
