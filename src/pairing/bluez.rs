//! bluetoothd registration of the pairing agent, adapter readiness and
//! peer discovery

use async_trait::async_trait;
use bluer::agent::{
    Agent, AgentHandle, AuthorizeService, ReqError, ReqResult, RequestAuthorization,
    RequestConfirmation,
};
use bluer::{Adapter, Address, Session};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::agent::{is_audio_uuid, PairingAgent, PairingError};
use super::peer::{PeerCandidate, PeerDirectory};
use crate::registry::MacAddress;

/// Delay between readiness checks
const READY_POLL: Duration = Duration::from_secs(1);

fn bluez_error(context: &str) -> impl Fn(bluer::Error) -> PairingError + '_ {
    move |e| PairingError::Bluez(format!("{}: {}", context, e))
}

fn to_mac(address: Address) -> ReqResult<MacAddress> {
    address.to_string().parse().map_err(|_| ReqError::Rejected)
}

/// Agent registered as the default agent; unregistered on [`unregister`]
/// or drop
///
/// [`unregister`]: AgentRegistration::unregister
pub struct AgentRegistration {
    _session: Session,
    handle: Option<AgentHandle>,
    agent: Arc<dyn PairingAgent>,
}

impl AgentRegistration {
    /// Register `agent` and make the default adapter pairable and discoverable
    pub async fn register(agent: Arc<dyn PairingAgent>) -> Result<Self, PairingError> {
        let session = Session::new()
            .await
            .map_err(bluez_error("Failed to create BlueZ session"))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(bluez_error("Failed to get adapter"))?;

        adapter
            .set_powered(true)
            .await
            .map_err(bluez_error("Failed to power adapter"))?;
        adapter
            .set_pairable(true)
            .await
            .map_err(bluez_error("Failed to set pairable"))?;
        adapter
            .set_discoverable(true)
            .await
            .map_err(bluez_error("Failed to set discoverable"))?;

        let confirm = agent.clone();
        let authorize = agent.clone();
        let service = agent.clone();
        let bluer_agent = Agent {
            request_default: true,
            request_confirmation: Some(Box::new(move |req: RequestConfirmation| {
                let agent = confirm.clone();
                Box::pin(async move {
                    let device = to_mac(req.device)?;
                    agent
                        .confirm_pairing(device, Some(req.passkey))
                        .await
                        .map_err(|_| ReqError::Rejected)
                })
            })),
            request_authorization: Some(Box::new(move |req: RequestAuthorization| {
                let agent = authorize.clone();
                Box::pin(async move {
                    let device = to_mac(req.device)?;
                    agent
                        .confirm_pairing(device, None)
                        .await
                        .map_err(|_| ReqError::Rejected)
                })
            })),
            authorize_service: Some(Box::new(move |req: AuthorizeService| {
                let agent = service.clone();
                Box::pin(async move {
                    let device = to_mac(req.device)?;
                    agent
                        .authorize_service(device, &req.service.to_string())
                        .await
                        .map_err(|_| ReqError::Rejected)
                })
            })),
            ..Default::default()
        };

        let handle = session
            .register_agent(bluer_agent)
            .await
            .map_err(bluez_error("Failed to register agent"))?;
        info!("Pairing agent registered on {}", adapter.name());

        Ok(Self {
            _session: session,
            handle: Some(handle),
            agent,
        })
    }

    /// Unregister from bluetoothd and run the agent's release hook
    pub async fn unregister(mut self) {
        if self.handle.take().is_some() {
            self.agent.release().await;
        } else {
            warn!("Pairing agent already unregistered");
        }
    }
}

/// Devices known to the default adapter
#[derive(Default)]
pub struct BluezDirectory {
    session: OnceCell<Session>,
}

impl BluezDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&self) -> Result<Adapter, PairingError> {
        let session = self
            .session
            .get_or_try_init(|| async {
                Session::new()
                    .await
                    .map_err(bluez_error("Failed to create BlueZ session"))
            })
            .await?;
        session
            .default_adapter()
            .await
            .map_err(bluez_error("Failed to get adapter"))
    }

    async fn power_on(&self) -> Result<(), PairingError> {
        let adapter = self.adapter().await?;
        let powered = adapter
            .is_powered()
            .await
            .map_err(bluez_error("Failed to read adapter power"))?;
        if !powered {
            info!("Powering adapter {}", adapter.name());
            adapter
                .set_powered(true)
                .await
                .map_err(bluez_error("Failed to power adapter"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerDirectory for BluezDirectory {
    async fn wait_until_ready(&self, timeout: Duration) -> Result<(), PairingError> {
        let deadline = Instant::now() + timeout;
        loop {
            let reason = match self.power_on().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if Instant::now() >= deadline {
                return Err(PairingError::Bluez(format!(
                    "not ready after {:?}: {}",
                    timeout, reason
                )));
            }
            debug!("Bluetooth not ready yet: {}", reason);
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn candidates(&self) -> Result<Vec<PeerCandidate>, PairingError> {
        let adapter = self.adapter().await?;
        let addresses = adapter
            .device_addresses()
            .await
            .map_err(bluez_error("Failed to list devices"))?;

        let mut candidates = Vec::with_capacity(addresses.len());
        for address in addresses {
            let Ok(mac) = address.to_string().parse::<MacAddress>() else {
                continue;
            };
            let device = adapter
                .device(address)
                .map_err(bluez_error("Failed to open device"))?;
            let connected = device.is_connected().await.unwrap_or(false);
            let audio = match device.uuids().await {
                Ok(Some(uuids)) => uuids.iter().any(|u| is_audio_uuid(&u.to_string())),
                _ => false,
            };
            candidates.push(PeerCandidate {
                address: mac,
                connected,
                audio,
            });
        }
        Ok(candidates)
    }

    async fn trust_and_connect(&self, address: MacAddress) -> Result<(), PairingError> {
        let adapter = self.adapter().await?;
        let device = adapter
            .device(Address::new(address.octets()))
            .map_err(bluez_error("Failed to open device"))?;
        device
            .set_trusted(true)
            .await
            .map_err(bluez_error("Failed to trust device"))?;
        let connected = device
            .is_connected()
            .await
            .map_err(bluez_error("Failed to read connection state"))?;
        if !connected {
            info!("Connecting {}", address);
            device
                .connect()
                .await
                .map_err(bluez_error("Failed to connect device"))?;
        }
        Ok(())
    }
}
