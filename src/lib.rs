//! audio-router - PCM routing over an ALSA loopback bus
//!
//! Sources (a Bluetooth peer, a network stream) write into the loopback
//! bus; output bridges relay the bus to aliased devices. A health
//! supervisor keeps the bridge processes alive and resolves device
//! contention between them.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod pairing;
pub mod registry;
pub mod supervisor;
pub mod utils;

pub use error::{AppError, Result};
