// Platform seam for the initiator side of the handshake.
//
// The core never touches BLE hardware. Platform code (CoreBluetooth,
// Android, or btleplug)
// implements these traits and the handshake driver calls them one GATT
// operation at a time, which is all the transport allows per connection.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum LinkError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("service discovery failed")]
    DiscoveryFailed,
    #[error("characteristic read failed")]
    ReadFailed,
    #[error("characteristic write failed")]
    WriteFailed,
    #[error("link closed")]
    Closed,
}

/// One live GATT connection to a remote responder.
///
/// Operations map 1:1 onto the platform's GATT primitives. `request_mtu` is
/// best-effort: an `Err` means the request was refused, not that the link is
/// dead, and the caller proceeds at the previous transfer unit.
#[async_trait]
pub trait GattLink: Send {
    /// Request a larger transfer unit; returns the negotiated value.
    async fn request_mtu(&mut self, mtu: u16) -> Result<u16, LinkError>;

    /// Discover the proximity service and its handshake characteristic.
    async fn discover_service(&mut self) -> Result<(), LinkError>;

    /// Read the handshake characteristic, returning the full response.
    async fn read_characteristic(&mut self) -> Result<Vec<u8>, LinkError>;

    /// Write a frame to the handshake characteristic and await the
    /// acknowledgement. On some transports the ack never arrives; the
    /// driver bounds this call with its own timeout.
    async fn write_characteristic(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// Tear the connection down. Idempotent.
    async fn disconnect(&mut self);
}

/// Opens GATT connections to discovered peers.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn open(&self, peer_address: &str) -> Result<Box<dyn GattLink>, LinkError>;
}
