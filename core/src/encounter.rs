// Encounter attestation codec and the proximity decision.
//
// An attestation is a fixed 24-byte record of when and where a device was
// at the moment of a handshake: big-endian epoch milliseconds followed by
// IEEE-754 latitude and longitude. Peers exchange these encrypted and each
// side decides locally whether the two samples plausibly describe the same
// place at the same time.

use thiserror::Error;

/// Exact encoded size of an attestation. Never padded, never truncated.
pub const ATTESTATION_SIZE: usize = 24;

/// Two attestations must be sampled within this many milliseconds of each
/// other before spatial distance means anything. Guards against stale cached
/// attestations being replayed as proof of current proximity.
pub const TIME_WINDOW_MS: i64 = 120_000;

/// Great-circle distance below which two peers count as proximate, in
/// kilometres after rounding.
pub const PROXIMITY_THRESHOLD_KM: i64 = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncounterError {
    #[error("attestation must be exactly {ATTESTATION_SIZE} bytes, got {0}")]
    WrongSize(usize),
}

/// A timestamped position sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attestation {
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
}

impl Attestation {
    pub fn new(timestamp_ms: i64, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp_ms,
            latitude,
            longitude,
        }
    }

    /// Encode to the canonical 24-byte wire form.
    pub fn encode(&self) -> [u8; ATTESTATION_SIZE] {
        let mut out = [0u8; ATTESTATION_SIZE];
        out[0..8].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        out[8..16].copy_from_slice(&self.latitude.to_be_bytes());
        out[16..24].copy_from_slice(&self.longitude.to_be_bytes());
        out
    }

    /// Decode from the canonical wire form. Anything other than exactly
    /// 24 bytes is a defect in the sender, not a state we tolerate.
    pub fn decode(bytes: &[u8]) -> Result<Self, EncounterError> {
        if bytes.len() != ATTESTATION_SIZE {
            return Err(EncounterError::WrongSize(bytes.len()));
        }
        let mut field = [0u8; 8];
        field.copy_from_slice(&bytes[0..8]);
        let timestamp_ms = i64::from_be_bytes(field);
        field.copy_from_slice(&bytes[8..16]);
        let latitude = f64::from_be_bytes(field);
        field.copy_from_slice(&bytes[16..24]);
        let longitude = f64::from_be_bytes(field);
        Ok(Self {
            timestamp_ms,
            latitude,
            longitude,
        })
    }
}

/// Decide whether two attestations indicate physical co-presence.
///
/// Rejects outright when the samples are more than two minutes apart, then
/// computes the haversine great-circle distance, rounds to the nearest
/// kilometre, and accepts below the threshold. Symmetric in its arguments.
pub fn check_proximity(a: &Attestation, b: &Attestation, earth_radius_km: f64) -> bool {
    if (a.timestamp_ms - b.timestamp_ms).abs() > TIME_WINDOW_MS {
        return false;
    }

    let lat_delta = (a.latitude - b.latitude).to_radians();
    let lon_delta = (a.longitude - b.longitude).to_radians();
    let h = (lat_delta / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos()
            * b.latitude.to_radians().cos()
            * (lon_delta / 2.0).sin().powi(2);
    let central_angle = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    let distance_km = (earth_radius_km * central_angle).round() as i64;

    distance_km < PROXIMITY_THRESHOLD_KM
}
