// Immutable protocol parameters, fixed for the process lifetime.

use uuid::{uuid, Uuid};

/// GATT service UUID advertised by the responder.
pub const PROXIMITY_SERVICE_UUID: Uuid = uuid!("8a970001-b9ab-4c93-a102-6d4a75e9b5a4");

/// Single read/write characteristic carrying handshake frames.
pub const PROXIMITY_CHARACTERISTIC_UUID: Uuid = uuid!("8a970002-b9ab-4c93-a102-6d4a75e9b5a4");

/// Key pair validity window (seconds). One key pair per bucket.
pub const DEFAULT_KEY_VALIDITY_SECS: u64 = 15 * 60;

/// Incubation window (seconds) bounding how far back stored encounters
/// remain relevant to the persistence collaborator.
pub const DEFAULT_INCUBATION_SECS: u64 = 14 * 24 * 3600;

/// Mean Earth radius used by the haversine proximity check.
pub const DEFAULT_EARTH_RADIUS_KM: f64 = 6371.0;

/// MTU the initiator requests after connecting. Best-effort; the peer may
/// refuse and the handshake proceeds at the default transfer unit.
pub const REQUESTED_MTU: u16 = 80;

/// ATT reserves 3 bytes of every transfer unit for the opcode and handle.
pub const ATT_OVERHEAD: u16 = 3;

/// Protocol configuration supplied by the caller at start.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// GATT service UUID to register and discover.
    pub service_uuid: Uuid,
    /// Characteristic UUID the handshake runs over.
    pub characteristic_uuid: Uuid,
    /// Session key pair validity window in seconds.
    pub key_validity_secs: u64,
    /// Incubation window in seconds.
    pub incubation_secs: u64,
    /// Earth radius constant for the proximity check.
    pub earth_radius_km: f64,
    /// Organization tag carried in every handshake message.
    pub organization: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            service_uuid: PROXIMITY_SERVICE_UUID,
            characteristic_uuid: PROXIMITY_CHARACTERISTIC_UUID,
            key_validity_secs: DEFAULT_KEY_VALIDITY_SECS,
            incubation_secs: DEFAULT_INCUBATION_SECS,
            earth_radius_km: DEFAULT_EARTH_RADIUS_KM,
            organization: String::new(),
        }
    }
}

impl ProtocolConfig {
    /// Usable payload bytes for a negotiated transfer unit.
    pub fn usable_mtu(negotiated: u16) -> u16 {
        negotiated.saturating_sub(ATT_OVERHEAD)
    }
}
