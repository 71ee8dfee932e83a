//! Bluetooth peer discovery for the source bridge worker
//!
//! In auto mode the worker does not need a configured address: it takes any
//! connected device offering an audio service, sticking with the preferred
//! one while it is still there.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::agent::PairingError;
use crate::config::PeerMode;
use crate::error::{AppError, Result};
use crate::registry::MacAddress;

/// A device known to the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCandidate {
    pub address: MacAddress,
    pub connected: bool,
    /// Advertises an A2DP service
    pub audio: bool,
}

/// Host Bluetooth stack as seen by the worker
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Wait until the daemon answers and the adapter is powered
    async fn wait_until_ready(&self, timeout: Duration) -> std::result::Result<(), PairingError>;

    async fn candidates(&self) -> std::result::Result<Vec<PeerCandidate>, PairingError>;

    /// Mark the device trusted and connect it if it is not connected
    async fn trust_and_connect(&self, address: MacAddress) -> std::result::Result<(), PairingError>;
}

/// Pick a connected audio peer, keeping `preferred` when it is one of them
pub fn choose_peer(candidates: &[PeerCandidate], preferred: Option<MacAddress>) -> Option<MacAddress> {
    let mut usable = candidates.iter().filter(|c| c.connected && c.audio);
    match preferred {
        Some(want) if usable.clone().any(|c| c.address == want) => Some(want),
        _ => usable.next().map(|c| c.address),
    }
}

/// Poll the directory until a connected audio peer shows up
///
/// Returns `None` when cancelled.
pub async fn select_peer(
    directory: &dyn PeerDirectory,
    preferred: Option<MacAddress>,
    poll: Duration,
    cancel: &CancellationToken,
) -> Option<MacAddress> {
    let mut waiting_logged = false;
    loop {
        match directory.candidates().await {
            Ok(candidates) => {
                if let Some(peer) = choose_peer(&candidates, preferred) {
                    if let Err(e) = directory.trust_and_connect(peer).await {
                        warn!("Failed to trust/connect {}: {}", peer, e);
                    }
                    info!("Selected Bluetooth peer {}", peer);
                    return Some(peer);
                }
                if !waiting_logged {
                    info!("No connected audio device yet, waiting for a peer");
                    waiting_logged = true;
                }
                debug!("{} known device(s), none usable", candidates.len());
            }
            Err(e) => warn!("Failed to list Bluetooth devices: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Decide which peer the Bluetooth worker bridges
///
/// Waits for the stack first. An explicit address always wins; otherwise
/// `Fixed` needs `configured` and `Auto` waits for a connected audio device,
/// preferring `configured`. `Ok(None)` means cancelled while waiting.
pub async fn resolve_peer(
    directory: &dyn PeerDirectory,
    mode: PeerMode,
    explicit: Option<MacAddress>,
    configured: Option<MacAddress>,
    ready_timeout: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<Option<MacAddress>> {
    let fixed = match (explicit, mode) {
        (Some(address), _) => Some(address),
        (None, PeerMode::Fixed) => Some(configured.ok_or_else(|| {
            AppError::Config("peer_mode is fixed but no peer_address is set".to_string())
        })?),
        (None, PeerMode::Auto) => None,
    };

    directory
        .wait_until_ready(ready_timeout)
        .await
        .map_err(|e| AppError::Bluetooth(e.to_string()))?;

    match fixed {
        Some(address) => {
            if let Err(e) = directory.trust_and_connect(address).await {
                warn!("Failed to trust/connect {}: {}", address, e);
            }
            Ok(Some(address))
        }
        None => Ok(select_peer(directory, configured, poll, cancel).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn peer(addr: &str, connected: bool, audio: bool) -> PeerCandidate {
        PeerCandidate {
            address: mac(addr),
            connected,
            audio,
        }
    }

    #[test]
    fn test_choose_prefers_current_peer() {
        let list = [
            peer("11:11:11:11:11:11", true, true),
            peer("22:22:22:22:22:22", true, true),
        ];
        assert_eq!(
            choose_peer(&list, Some(mac("22:22:22:22:22:22"))),
            Some(mac("22:22:22:22:22:22"))
        );
        assert_eq!(choose_peer(&list, None), Some(mac("11:11:11:11:11:11")));
    }

    #[test]
    fn test_choose_skips_disconnected_and_non_audio() {
        let list = [
            peer("11:11:11:11:11:11", false, true),
            peer("22:22:22:22:22:22", true, false),
            peer("33:33:33:33:33:33", true, true),
        ];
        // Preferred but gone: fall back to what is connected
        assert_eq!(
            choose_peer(&list, Some(mac("11:11:11:11:11:11"))),
            Some(mac("33:33:33:33:33:33"))
        );
        assert_eq!(choose_peer(&list[..2], None), None);
    }

    struct FakeDirectory {
        ready: bool,
        rounds: Mutex<VecDeque<Vec<PeerCandidate>>>,
        connected: Mutex<Vec<MacAddress>>,
    }

    impl Default for FakeDirectory {
        fn default() -> Self {
            Self {
                ready: true,
                rounds: Mutex::new(VecDeque::new()),
                connected: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PeerDirectory for FakeDirectory {
        async fn wait_until_ready(&self, _timeout: Duration) -> std::result::Result<(), PairingError> {
            if self.ready {
                Ok(())
            } else {
                Err(PairingError::Bluez("adapter not powered".into()))
            }
        }

        async fn candidates(&self) -> std::result::Result<Vec<PeerCandidate>, PairingError> {
            Ok(self.rounds.lock().pop_front().unwrap_or_default())
        }

        async fn trust_and_connect(&self, address: MacAddress) -> std::result::Result<(), PairingError> {
            self.connected.lock().push(address);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_select_waits_for_a_peer() {
        let directory = FakeDirectory::default();
        directory.rounds.lock().extend([
            Vec::new(),
            vec![peer("11:11:11:11:11:11", false, true)],
            vec![peer("11:11:11:11:11:11", true, true)],
        ]);

        let picked = select_peer(
            &directory,
            None,
            Duration::from_millis(1),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(picked, Some(mac("11:11:11:11:11:11")));
        assert_eq!(*directory.connected.lock(), vec![mac("11:11:11:11:11:11")]);
    }

    #[tokio::test]
    async fn test_select_stops_on_cancel() {
        let directory = FakeDirectory::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let picked = select_peer(&directory, None, Duration::from_secs(60), &cancel).await;
        assert!(picked.is_none());
        assert!(directory.connected.lock().is_empty());
    }

    async fn resolve(
        directory: &FakeDirectory,
        mode: PeerMode,
        explicit: Option<MacAddress>,
        configured: Option<MacAddress>,
    ) -> Result<Option<MacAddress>> {
        resolve_peer(
            directory,
            mode,
            explicit,
            configured,
            Duration::from_millis(10),
            Duration::from_millis(1),
            &CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn test_resolve_auto_prefers_configured_peer() {
        let directory = FakeDirectory::default();
        directory.rounds.lock().push_back(vec![
            peer("11:11:11:11:11:11", true, true),
            peer("22:22:22:22:22:22", true, true),
        ]);
        let picked = resolve(
            &directory,
            PeerMode::Auto,
            None,
            Some(mac("22:22:22:22:22:22")),
        )
        .await
        .unwrap();
        assert_eq!(picked, Some(mac("22:22:22:22:22:22")));
    }

    #[tokio::test]
    async fn test_resolve_fixed_needs_an_address() {
        let directory = FakeDirectory::default();
        let err = resolve(&directory, PeerMode::Fixed, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_CONFIG);

        let configured = Some(mac("33:33:33:33:33:33"));
        let picked = resolve(&directory, PeerMode::Fixed, None, configured)
            .await
            .unwrap();
        assert_eq!(picked, configured);
        assert_eq!(*directory.connected.lock(), vec![mac("33:33:33:33:33:33")]);
    }

    #[tokio::test]
    async fn test_resolve_fails_when_stack_not_ready() {
        let directory = FakeDirectory {
            ready: false,
            ..Default::default()
        };
        let err = resolve(
            &directory,
            PeerMode::Auto,
            Some(mac("44:44:44:44:44:44")),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Bluetooth(_)));
        assert_eq!(err.exit_code(), crate::error::EXIT_RUNTIME);
        assert!(directory.connected.lock().is_empty());
    }
}
