// Wire framing for the handshake characteristic.
//
// Every exchange over the characteristic is one frame:
// `[command: 0x01][length: u8][bincode-encoded HandshakeMessage]`.
// Writes may arrive split into fragments no larger than the negotiated
// transfer unit, so the receiver accumulates bytes and re-runs [`unframe`]
// until a whole frame is present.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only frame type the protocol defines.
pub const FRAME_COMMAND: u8 = 0x01;

/// Command byte plus one length byte.
pub const FRAME_HEADER_SIZE: usize = 2;

/// A single length byte bounds the schema body.
pub const MAX_BODY_SIZE: usize = u8::MAX as usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("frame body is {0} bytes, limit is {MAX_BODY_SIZE}")]
    PayloadTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// The handshake payload carried in every frame.
///
/// An empty `encounter` marks a round-1 (key-only) message; a non-empty one
/// carries the sealed attestation of round 2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub version: u32,
    pub organization: String,
    pub public_key: Vec<u8>,
    pub encounter: Vec<u8>,
}

impl HandshakeMessage {
    /// True for a round-1 message that only exchanges public keys.
    pub fn is_key_only(&self) -> bool {
        self.encounter.is_empty()
    }
}

/// Outcome of [`unframe`] on an accumulation buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Unframed {
    /// A complete frame was decoded.
    Complete(HandshakeMessage),
    /// The buffer does not yet hold a whole frame; keep accumulating.
    NeedMoreData,
}

/// Serialize a message and prepend the frame header.
pub fn frame(message: &HandshakeMessage) -> Result<Vec<u8>, WireError> {
    let body = bincode::serialize(message)
        .map_err(|e| WireError::Malformed(e.to_string()))?;
    if body.len() > MAX_BODY_SIZE {
        return Err(WireError::PayloadTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    out.push(FRAME_COMMAND);
    out.push(body.len() as u8);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Try to decode one frame from an accumulation buffer.
///
/// Fewer than two header bytes, or fewer bytes than the declared body
/// length, is not an error: the transport is still delivering fragments.
/// A wrong command byte or an undecodable body poisons the whole transfer
/// and the caller must drop its buffered state for that peer.
pub fn unframe(accumulated: &[u8]) -> Result<Unframed, WireError> {
    if accumulated.len() < FRAME_HEADER_SIZE {
        return Ok(Unframed::NeedMoreData);
    }
    let command = accumulated[0];
    let declared = accumulated[1] as usize;
    if accumulated.len() < declared + FRAME_HEADER_SIZE {
        return Ok(Unframed::NeedMoreData);
    }
    if command != FRAME_COMMAND {
        return Err(WireError::Malformed(format!(
            "unexpected command byte 0x{command:02x}"
        )));
    }
    let body = &accumulated[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + declared];
    let message: HandshakeMessage = bincode::deserialize(body)
        .map_err(|e| WireError::Malformed(e.to_string()))?;
    Ok(Unframed::Complete(message))
}
