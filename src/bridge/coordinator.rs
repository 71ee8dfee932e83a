//! Keeps the Bluetooth peer alias pointed at the most recently paired device

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::pairing::is_audio_uuid;
use crate::registry::{BtProfile, DeviceRegistry, MacAddress, PcmTarget};
use crate::supervisor::SupervisorCommand;

pub struct PeerCoordinator {
    config: ConfigStore,
    registry: DeviceRegistry,
    events: Arc<EventBus>,
    commands: mpsc::Sender<SupervisorCommand>,
}

impl PeerCoordinator {
    pub fn new(
        config: ConfigStore,
        events: Arc<EventBus>,
        commands: mpsc::Sender<SupervisorCommand>,
    ) -> Self {
        let registry = DeviceRegistry::new(config.get().devices.mapping_dir.clone());
        Self {
            config,
            registry,
            events,
            commands,
        }
    }

    /// React to one event; returns whether the peer changed
    pub async fn handle(&self, event: &SystemEvent) -> Result<bool> {
        match event {
            SystemEvent::DevicePaired { address, .. } => self.record_peer(*address).await,
            SystemEvent::ServiceAuthorized { address, uuid } if is_audio_uuid(uuid) => {
                self.record_peer(*address).await
            }
            SystemEvent::ServiceAuthorized { address, uuid } => {
                debug!("Ignoring non-audio service {} for {}", uuid, address);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Point the peer alias and `peer_address` at `address` and retarget
    /// the Bluetooth bridge unit
    pub async fn record_peer(&self, address: MacAddress) -> Result<bool> {
        let config = self.config.get();
        let alias = &config.devices.peer_alias;
        let target = PcmTarget::Bluetooth {
            address,
            profile: BtProfile::A2dp,
        };

        let mapped = matches!(self.registry.resolve(alias), Ok(ref t) if *t == target);
        if mapped && config.devices.peer_address == Some(address) {
            debug!("Peer {} already current", address);
            return Ok(false);
        }

        self.registry.register(alias, &target)?;
        self.config
            .set_value("peer_address", &address.to_string())
            .await?;
        info!("Peer is now {} ({})", address, alias);

        self.events.publish(SystemEvent::PeerChanged {
            address,
            alias: alias.to_string(),
        });
        self.commands
            .send(SupervisorCommand::Retarget(address))
            .await
            .map_err(|_| AppError::Supervisor("supervisor command channel closed".to_string()))?;
        Ok(true)
    }

    /// Follow pairing events until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut rx = self.events.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.handle(&event).await {
                            warn!("Failed to handle {}: {}", event.event_name(), e);
                            self.events.publish(SystemEvent::SystemError {
                                module: "coordinator".to_string(),
                                message: e.to_string(),
                            });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Peer coordinator lagged, {} events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        debug!("Peer coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    const A2DP_SINK: &str = "0000110b-0000-1000-8000-00805f9b34fb";
    const HID: &str = "00001124-0000-1000-8000-00805f9b34fb";

    struct Fixture {
        dir: tempfile::TempDir,
        coordinator: PeerCoordinator,
        commands: mpsc::Receiver<SupervisorCommand>,
        events: Arc<EventBus>,
        store: ConfigStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.devices.mapping_dir = dir.path().join("pcm");
        let store = ConfigStore::from_config(dir.path().join("router.conf"), config);
        let events = Arc::new(EventBus::new());
        let (tx, commands) = mpsc::channel(8);
        let coordinator = PeerCoordinator::new(store.clone(), events.clone(), tx);
        Fixture {
            dir,
            coordinator,
            commands,
            events,
            store,
        }
    }

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_paired_device_becomes_peer() {
        let mut fx = fixture();
        let mut published = fx.events.subscribe();
        let addr = mac("AA:BB:CC:DD:EE:FF");

        let changed = fx
            .coordinator
            .handle(&SystemEvent::DevicePaired {
                address: addr,
                passkey: Some(123456),
            })
            .await
            .unwrap();
        assert!(changed);

        let registry = DeviceRegistry::new(fx.dir.path().join("pcm"));
        assert_eq!(
            registry.resolve(&fx.store.get().devices.peer_alias).unwrap(),
            PcmTarget::Bluetooth {
                address: addr,
                profile: BtProfile::A2dp
            }
        );
        assert_eq!(fx.store.get().devices.peer_address, Some(addr));
        let text = std::fs::read_to_string(fx.dir.path().join("router.conf")).unwrap();
        assert!(text.contains("peer_address=AA:BB:CC:DD:EE:FF"));

        assert_eq!(
            fx.commands.try_recv().unwrap(),
            SupervisorCommand::Retarget(addr)
        );
        assert!(matches!(
            published.try_recv().unwrap(),
            SystemEvent::PeerChanged { .. }
        ));

        // Same device again is a no-op
        assert!(!fx.coordinator.record_peer(addr).await.unwrap());
        assert!(fx.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_only_audio_services_retarget() {
        let mut fx = fixture();
        let addr = mac("11:22:33:44:55:66");

        let hid = SystemEvent::ServiceAuthorized {
            address: addr,
            uuid: HID.to_string(),
        };
        assert!(!fx.coordinator.handle(&hid).await.unwrap());
        assert!(fx.commands.try_recv().is_err());

        let a2dp = SystemEvent::ServiceAuthorized {
            address: addr,
            uuid: A2DP_SINK.to_string(),
        };
        assert!(fx.coordinator.handle(&a2dp).await.unwrap());
        assert_eq!(
            fx.commands.try_recv().unwrap(),
            SupervisorCommand::Retarget(addr)
        );
    }

    #[tokio::test]
    async fn test_run_follows_event_bus() {
        let fx = fixture();
        let Fixture {
            coordinator,
            mut commands,
            events,
            ..
        } = fx;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(cancel.clone()));

        // Wait for the coordinator to subscribe
        while events.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        let addr = mac("AA:BB:CC:00:11:22");
        events.publish(SystemEvent::DevicePaired {
            address: addr,
            passkey: None,
        });

        let command = tokio::time::timeout(std::time::Duration::from_secs(2), commands.recv())
            .await
            .unwrap();
        assert_eq!(command, Some(SupervisorCommand::Retarget(addr)));

        cancel.cancel();
        task.await.unwrap();
    }
}
