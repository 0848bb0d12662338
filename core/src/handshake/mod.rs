// Two-round handshake over a single GATT characteristic.
//
// Round 1 exchanges public keys in the clear; each side then derives the
// same ECDH secret. Round 2 repeats the read/write pair with a sealed
// attestation attached, letting both sides check co-presence locally.
//
// - **client**: the initiator state machine and its async driver
// - **server**: the responder, reacting to read/write requests per peer
// - **link**: the platform seam the driver speaks through

pub mod client;
pub mod link;
pub mod server;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::encounter::Attestation;
use crate::identity::IdentityProvider;

/// Version tag carried in every handshake message.
pub const PROTOCOL_VERSION: u32 = 1;

/// Signal strength recorded when the transport did not report one
/// (the responder never sees an advertisement RSSI).
pub const RSSI_UNKNOWN: i8 = -1;

/// The one artifact the core hands to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// True when this device initiated the connection.
    pub initiator: bool,
    /// Remote device address as reported by the platform.
    pub peer_address: String,
    /// Local wall-clock time of the exchange, epoch milliseconds.
    pub timestamp_ms: i64,
    /// Peer's organization tag.
    pub organization: String,
    /// Peer's protocol version.
    pub protocol_version: u32,
    /// Peer's session public key from the round-1 decode.
    pub peer_public_key: Vec<u8>,
    /// Advertisement RSSI in dBm, or [`RSSI_UNKNOWN`].
    pub rssi: i8,
}

/// Supplies the freshly sampled local attestation for a handshake round.
///
/// Returns `None` until the GPS collaborator has delivered a first fix, in
/// which case the handshake proceeds key-only.
pub trait AttestationSource: Send + Sync {
    fn sample(&self) -> Option<Attestation>;
}

/// Dependencies both handshake roles share, injected at construction.
#[derive(Clone)]
pub struct HandshakeContext {
    pub identity: Arc<IdentityProvider>,
    pub attestations: Arc<dyn AttestationSource>,
    pub organization: String,
    pub earth_radius_km: f64,
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn now_epoch_sec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
