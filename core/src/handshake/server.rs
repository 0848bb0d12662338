// Responder side of the handshake.
//
// The responder owns a session table keyed by peer address and only ever
// reacts: the remote initiator drives the connection, issues every read and
// write, and decides when to disconnect. Callbacks run on the platform's
// GATT thread, so everything here is quick, synchronous, and lock-brief.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::crypto::{self, SharedSecret};
use crate::encounter::{check_proximity, Attestation};
use crate::identity::compute_shared_secret;
use crate::wire::{frame, unframe, HandshakeMessage, Unframed};

use super::{now_epoch_sec, now_ms, ConnectionEvent, HandshakeContext, PROTOCOL_VERSION, RSSI_UNKNOWN};

/// GATT response status for a read or write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure,
}

/// Per-connected-device handshake state. Created on connect, destroyed on
/// disconnect; the write path mutates it only from that device's own
/// serialized callbacks.
#[derive(Default)]
struct PeerSession {
    /// Cached response frame, reused across fragmented reads of one round.
    read_response: Option<Vec<u8>>,
    /// Accumulated write fragments awaiting a complete frame.
    write_buf: Vec<u8>,
    peer_public_key: Option<Vec<u8>>,
    shared_secret: Option<SharedSecret>,
}

/// The GATT-server-side handshake responder.
pub struct ResponderServer {
    ctx: HandshakeContext,
    sessions: Mutex<HashMap<String, PeerSession>>,
    events: UnboundedSender<ConnectionEvent>,
}

impl ResponderServer {
    pub fn new(ctx: HandshakeContext, events: UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            ctx,
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// A peer connected; start it from a clean session.
    pub fn on_connect(&self, peer_address: &str) {
        debug!(peer = peer_address, "responder: peer connected");
        self.sessions
            .lock()
            .insert(peer_address.to_string(), PeerSession::default());
    }

    /// A peer disconnected; drop its session. Idempotent.
    pub fn on_disconnect(&self, peer_address: &str) {
        debug!(peer = peer_address, "responder: peer disconnected");
        self.sessions.lock().remove(peer_address);
    }

    /// Serve a read request: our key, plus a sealed attestation once the
    /// peer's round-1 write has let us derive the shared secret.
    pub fn handle_read(&self, peer_address: &str, offset: usize) -> (GattStatus, Vec<u8>) {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(peer_address.to_string()).or_insert_with(|| {
            warn!(peer = peer_address, "read from peer without connect callback");
            PeerSession::default()
        });

        if session.peer_public_key.is_some() && session.shared_secret.is_none() {
            self.derive_secret(peer_address, session);
        }

        if session.read_response.is_none() {
            match self.build_response(peer_address, session) {
                Ok(response) => session.read_response = Some(response),
                Err(e) => {
                    warn!(peer = peer_address, error = %e, "failed to build read response");
                    return (GattStatus::Failure, Vec::new());
                }
            }
        }

        // Cached above in both branches.
        let response = session.read_response.as_deref().unwrap_or_default();
        let slice = response.get(offset..).unwrap_or_default().to_vec();
        debug!(
            peer = peer_address,
            offset,
            len = slice.len(),
            "responder: serving read"
        );
        (GattStatus::Success, slice)
    }

    /// Accept a write fragment, reassemble, and process complete frames.
    pub fn handle_write(&self, peer_address: &str, fragment: &[u8]) -> GattStatus {
        if fragment.is_empty() {
            return GattStatus::Failure;
        }

        let mut sessions = self.sessions.lock();
        let session = sessions.entry(peer_address.to_string()).or_insert_with(|| {
            warn!(peer = peer_address, "write from peer without connect callback");
            PeerSession::default()
        });
        session.write_buf.extend_from_slice(fragment);

        match unframe(&session.write_buf) {
            Ok(Unframed::NeedMoreData) => {
                debug!(
                    peer = peer_address,
                    buffered = session.write_buf.len(),
                    "responder: awaiting more fragments"
                );
                GattStatus::Success
            }
            Ok(Unframed::Complete(message)) => {
                self.process_message(peer_address, session, message);
                // Ready for the next frame; keys survive for round 2.
                session.write_buf.clear();
                session.read_response = None;
                GattStatus::Success
            }
            Err(e) => {
                warn!(peer = peer_address, error = %e, "responder: dropping peer state");
                sessions.remove(peer_address);
                GattStatus::Failure
            }
        }
    }

    fn process_message(
        &self,
        peer_address: &str,
        session: &mut PeerSession,
        message: HandshakeMessage,
    ) {
        let Some(secret) = session.shared_secret.as_ref() else {
            // Round 1: remember the key and surface the contact.
            info!(
                peer = peer_address,
                key = %hex::encode(&message.public_key[..message.public_key.len().min(8)]),
                "responder: received peer key"
            );
            session.peer_public_key = Some(message.public_key.clone());
            let _ = self.events.send(ConnectionEvent {
                initiator: false,
                peer_address: peer_address.to_string(),
                timestamp_ms: now_ms(),
                organization: message.organization,
                protocol_version: message.version,
                peer_public_key: message.public_key,
                rssi: RSSI_UNKNOWN,
            });
            return;
        };

        // Round 2: open the peer's attestation and evaluate co-presence.
        let opened = match crypto::open(secret, &message.encounter) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = peer_address, error = %e, "responder: attestation rejected");
                return;
            }
        };
        let peer_attestation = match Attestation::decode(&opened) {
            Ok(a) => a,
            Err(e) => {
                warn!(peer = peer_address, error = %e, "responder: attestation malformed");
                return;
            }
        };
        match self.ctx.attestations.sample() {
            Some(local) => {
                let proximate =
                    check_proximity(&local, &peer_attestation, self.ctx.earth_radius_km);
                info!(peer = peer_address, proximate, "responder: proximity evaluated");
            }
            None => debug!(peer = peer_address, "no local fix, skipping proximity check"),
        }
    }

    fn derive_secret(&self, peer_address: &str, session: &mut PeerSession) {
        // Checked by the caller.
        let Some(peer_key) = session.peer_public_key.as_deref() else {
            return;
        };
        let pair = self.ctx.identity.key_pair(now_epoch_sec());
        match compute_shared_secret(pair.secret(), peer_key) {
            Ok(secret) => {
                debug!(peer = peer_address, "responder: shared secret derived");
                session.shared_secret = Some(secret);
            }
            Err(e) => {
                warn!(peer = peer_address, error = %e, "responder: bad peer key");
            }
        }
    }

    fn build_response(
        &self,
        peer_address: &str,
        session: &PeerSession,
    ) -> Result<Vec<u8>, crate::wire::WireError> {
        let encounter = match (&session.shared_secret, self.ctx.attestations.sample()) {
            (Some(secret), Some(attestation)) => {
                match crypto::seal(secret, &attestation.encode()) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        warn!(peer = peer_address, error = %e, "responder: seal failed, serving key only");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };
        let pair = self.ctx.identity.key_pair(now_epoch_sec());
        frame(&HandshakeMessage {
            version: PROTOCOL_VERSION,
            organization: self.ctx.organization.clone(),
            public_key: pair.public_bytes().to_vec(),
            encounter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::config::DEFAULT_EARTH_RADIUS_KM;
    use crate::identity::{IdentityProvider, KeyPair};
    use crate::wire::FRAME_COMMAND;

    use super::super::AttestationSource;

    struct FixedSource(Attestation);

    impl AttestationSource for FixedSource {
        fn sample(&self) -> Option<Attestation> {
            Some(self.0)
        }
    }

    struct NoFixSource;

    impl AttestationSource for NoFixSource {
        fn sample(&self) -> Option<Attestation> {
            None
        }
    }

    fn test_server() -> (ResponderServer, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = HandshakeContext {
            identity: Arc::new(IdentityProvider::new(900)),
            attestations: Arc::new(FixedSource(Attestation::new(
                1_600_000_000_000,
                48.8584,
                2.2945,
            ))),
            organization: "org-test".to_string(),
            earth_radius_km: DEFAULT_EARTH_RADIUS_KM,
        };
        (ResponderServer::new(ctx, tx), rx)
    }

    fn round1_frame(pair: &KeyPair) -> Vec<u8> {
        frame(&HandshakeMessage {
            version: PROTOCOL_VERSION,
            organization: "org-peer".to_string(),
            public_key: pair.public_bytes().to_vec(),
            encounter: Vec::new(),
        })
        .expect("Framing should succeed")
    }

    #[test]
    fn test_first_read_is_key_only() {
        let (server, _rx) = test_server();
        server.on_connect("aa:bb");

        let (status, bytes) = server.handle_read("aa:bb", 0);
        assert_eq!(status, GattStatus::Success);
        match unframe(&bytes).expect("Should decode") {
            Unframed::Complete(m) => {
                assert!(m.is_key_only());
                assert_eq!(m.organization, "org-test");
                assert_eq!(m.public_key.len(), 32);
            }
            other => panic!("Expected complete frame, got {other:?}"),
        }
    }

    #[test]
    fn test_read_response_cached_across_offsets() {
        let (server, _rx) = test_server();
        server.on_connect("aa:bb");

        let (_, full) = server.handle_read("aa:bb", 0);
        let (_, tail) = server.handle_read("aa:bb", 10);
        assert_eq!(&full[10..], &tail[..]);
    }

    #[test]
    fn test_read_offset_past_end_is_empty() {
        let (server, _rx) = test_server();
        server.on_connect("aa:bb");

        let (status, bytes) = server.handle_read("aa:bb", 10_000);
        assert_eq!(status, GattStatus::Success);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_round1_write_emits_event() {
        let (server, mut rx) = test_server();
        server.on_connect("aa:bb");
        let peer = KeyPair::generate();

        let status = server.handle_write("aa:bb", &round1_frame(&peer));
        assert_eq!(status, GattStatus::Success);

        let event = rx.try_recv().expect("Event should be emitted");
        assert!(!event.initiator);
        assert_eq!(event.peer_address, "aa:bb");
        assert_eq!(event.organization, "org-peer");
        assert_eq!(event.protocol_version, PROTOCOL_VERSION);
        assert_eq!(event.peer_public_key, peer.public_bytes().to_vec());
        assert_eq!(event.rssi, RSSI_UNKNOWN);
    }

    #[test]
    fn test_fragmented_write_reassembles() {
        let (server, mut rx) = test_server();
        server.on_connect("aa:bb");
        let peer = KeyPair::generate();
        let frame_bytes = round1_frame(&peer);

        for chunk in frame_bytes.chunks(7) {
            assert_eq!(server.handle_write("aa:bb", chunk), GattStatus::Success);
        }

        assert!(rx.try_recv().is_ok(), "one event after reassembly");
        assert!(rx.try_recv().is_err(), "exactly one event");
    }

    #[test]
    fn test_malformed_command_clears_session_and_fails() {
        let (server, mut rx) = test_server();
        server.on_connect("aa:bb");
        let peer = KeyPair::generate();

        let mut bad = round1_frame(&peer);
        bad[0] = 0x02;
        assert_eq!(server.handle_write("aa:bb", &bad), GattStatus::Failure);
        assert!(rx.try_recv().is_err(), "no event for malformed frame");
        assert!(server.sessions.lock().get("aa:bb").is_none());
    }

    #[test]
    fn test_second_read_carries_sealed_attestation() {
        let (server, _rx) = test_server();
        server.on_connect("aa:bb");
        let peer = KeyPair::generate();

        // Round 1: client writes its key, then reads again.
        server.handle_write("aa:bb", &round1_frame(&peer));
        let (_, bytes) = server.handle_read("aa:bb", 0);

        let message = match unframe(&bytes).expect("Should decode") {
            Unframed::Complete(m) => m,
            other => panic!("Expected complete frame, got {other:?}"),
        };
        assert!(!message.is_key_only());

        // The client can open it with its own half of the exchange.
        let secret = compute_shared_secret(peer.secret(), &message.public_key)
            .expect("Valid server key");
        let opened = crypto::open(&secret, &message.encounter).expect("Should open");
        let attestation = Attestation::decode(&opened).expect("Should decode");
        assert_eq!(attestation.timestamp_ms, 1_600_000_000_000);
    }

    #[test]
    fn test_second_read_is_key_only_without_position_fix() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = HandshakeContext {
            identity: Arc::new(IdentityProvider::new(900)),
            attestations: Arc::new(NoFixSource),
            organization: "org-test".to_string(),
            earth_radius_km: DEFAULT_EARTH_RADIUS_KM,
        };
        let server = ResponderServer::new(ctx, tx);
        server.on_connect("aa:bb");
        let peer = KeyPair::generate();

        // Round 1 completed, secret derivable, but nothing sealable; the
        // next read must still serve a key-only frame.
        server.handle_write("aa:bb", &round1_frame(&peer));
        let (status, bytes) = server.handle_read("aa:bb", 0);
        assert_eq!(status, GattStatus::Success);
        match unframe(&bytes).expect("Should decode") {
            Unframed::Complete(m) => assert!(m.is_key_only()),
            other => panic!("Expected complete frame, got {other:?}"),
        }
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (server, _rx) = test_server();
        server.on_connect("aa:bb");
        server.on_disconnect("aa:bb");
        server.on_disconnect("aa:bb");
        assert!(server.sessions.lock().is_empty());
    }

    #[test]
    fn test_empty_fragment_fails() {
        let (server, _rx) = test_server();
        server.on_connect("aa:bb");
        assert_eq!(server.handle_write("aa:bb", &[]), GattStatus::Failure);
    }
}
