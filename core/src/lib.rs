// Murmur Core: privacy-preserving BLE proximity detection
//
// Two nearby devices exchange ephemeral public keys over a single GATT
// characteristic, derive a shared secret, and swap sealed location/time
// attestations so each side can decide locally whether the other was
// really close, really recently. Radios, GPS, storage and UI live in
// external collaborators; this crate is the protocol.

pub mod config;
mod core;
pub mod crypto;
pub mod encounter;
pub mod handshake;
pub mod identity;
pub mod wire;

use thiserror::Error;

pub use crate::core::{Core, DiscoveredPeer, PositionFix, PositionTracker};
pub use config::ProtocolConfig;
pub use encounter::{check_proximity, Attestation};
pub use handshake::client::{drive, ClientAction, ClientEvent, ClientState, HandshakeClient};
pub use handshake::link::{GattLink, LinkError, LinkFactory};
pub use handshake::server::{GattStatus, ResponderServer};
pub use handshake::{AttestationSource, ConnectionEvent, HandshakeContext};
pub use identity::{IdentityProvider, KeyPair};
pub use wire::{frame, unframe, HandshakeMessage, Unframed};

/// Lifecycle misuse. Fatal to the call, never to the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("already started")]
    AlreadyStarted,
    #[error("not started")]
    NotStarted,
}
