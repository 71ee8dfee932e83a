//! Pairing / authorization agent
//!
//! The router auto-accepts every pairing and service request. The agent
//! and peer selection logic are independent of D-Bus; [`bluez`] binds them
//! to bluetoothd when built with the `bluez` feature (on by default).

pub mod agent;
#[cfg(feature = "bluez")]
pub mod bluez;
pub mod peer;

pub use agent::{is_audio_uuid, AutoAcceptAgent, PairingAgent, PairingError};
#[cfg(feature = "bluez")]
pub use bluez::{AgentRegistration, BluezDirectory};
pub use peer::{choose_peer, resolve_peer, select_peer, PeerCandidate, PeerDirectory};
