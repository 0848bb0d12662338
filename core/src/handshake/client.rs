// Initiator side of the handshake.
//
// The platform delivers connection lifecycle and characteristic callbacks
// asynchronously; rather than nesting closures the way GATT APIs invite,
// the protocol is an explicit state machine: [`ClientEvent`]s go in,
// [`ClientAction`]s come out, and [`drive`] translates between the machine
// and a [`GattLink`]. Any step failure abandons the attempt; a failed
// handshake is never retried within the same connection.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::config::REQUESTED_MTU;
use crate::crypto::{self, SharedSecret};
use crate::encounter::{check_proximity, Attestation};
use crate::identity::compute_shared_secret;
use crate::wire::{frame, unframe, HandshakeMessage, Unframed};

use super::link::GattLink;
use super::{now_epoch_sec, now_ms, ConnectionEvent, HandshakeContext, PROTOCOL_VERSION};

/// An unacknowledged write is abandoned after this long. Some transports
/// deliver every fragment yet never fire the acknowledgement callback.
pub const WRITE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Initiator protocol states, in handshake order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    NegotiatingMtu,
    DiscoveringServices,
    ReadingPeerKey,
    WritingOwnKey,
    Disconnecting,
    Released,
}

/// Everything the platform can tell the initiator.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    /// MTU negotiation finished; `None` means the request was refused,
    /// which is not a failure.
    MtuNegotiated(Option<u16>),
    ServicesDiscovered { ok: bool },
    /// Read finished; `None` means the read failed.
    CharacteristicRead(Option<Vec<u8>>),
    WriteAcknowledged,
    WriteTimeout,
    Disconnected,
}

/// Everything the initiator can ask the platform to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    NegotiateMtu(u16),
    DiscoverServices,
    ReadCharacteristic,
    WriteCharacteristic(Vec<u8>),
    ArmWriteTimeout(Duration),
    CancelWriteTimeout,
    Disconnect,
    /// Terminal: the per-connection lock may be released.
    Release,
    Emit(ConnectionEvent),
}

/// The initiator state machine for one connection attempt.
pub struct HandshakeClient {
    ctx: HandshakeContext,
    peer_address: String,
    rssi: i8,
    state: ClientState,
    secret: Option<SharedSecret>,
    peer_public_key: Option<Vec<u8>>,
    peer_organization: String,
    peer_version: u32,
    proximity: Option<bool>,
}

impl HandshakeClient {
    pub fn new(ctx: HandshakeContext, peer_address: String, rssi: i8) -> Self {
        Self {
            ctx,
            peer_address,
            rssi,
            state: ClientState::Connecting,
            secret: None,
            peer_public_key: None,
            peer_organization: String::new(),
            peer_version: PROTOCOL_VERSION,
            proximity: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Outcome of the round-2 proximity check, once evaluated.
    pub fn proximity(&self) -> Option<bool> {
        self.proximity
    }

    /// Advance the machine on a platform event.
    pub fn handle(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        debug!(peer = %self.peer_address, state = ?self.state, event = ?event, "client step");
        match (self.state, event) {
            // A disconnect in any state ends the attempt.
            (_, ClientEvent::Disconnected) => {
                self.state = ClientState::Released;
                vec![ClientAction::Release]
            }
            (ClientState::Connecting, ClientEvent::Connected) => {
                self.state = ClientState::NegotiatingMtu;
                vec![ClientAction::NegotiateMtu(REQUESTED_MTU)]
            }
            // Granted or refused, MTU negotiation never aborts the attempt.
            (ClientState::NegotiatingMtu, ClientEvent::MtuNegotiated(granted)) => {
                if let Some(mtu) = granted {
                    debug!(peer = %self.peer_address, mtu, "transfer unit negotiated");
                }
                self.state = ClientState::DiscoveringServices;
                vec![ClientAction::DiscoverServices]
            }
            (ClientState::DiscoveringServices, ClientEvent::ServicesDiscovered { ok: true }) => {
                self.state = ClientState::ReadingPeerKey;
                vec![ClientAction::ReadCharacteristic]
            }
            (ClientState::DiscoveringServices, ClientEvent::ServicesDiscovered { ok: false }) => {
                self.disconnect()
            }
            (ClientState::ReadingPeerKey, ClientEvent::CharacteristicRead(Some(bytes))) => {
                // A malformed response is logged and skipped; the write
                // still goes out so the responder learns our key.
                self.process_read(&bytes);
                self.write_own_key()
            }
            (ClientState::ReadingPeerKey, ClientEvent::CharacteristicRead(None)) => {
                self.disconnect()
            }
            (ClientState::WritingOwnKey, ClientEvent::WriteAcknowledged) => {
                let mut actions = vec![ClientAction::CancelWriteTimeout];
                if self.secret.is_some() {
                    // Round 2 acknowledged: the exchange is complete.
                    actions.extend(self.finish());
                    return actions;
                }
                // Round 1 acknowledged: derive the secret and go again.
                match self.derive_secret() {
                    Ok(()) => {
                        self.state = ClientState::ReadingPeerKey;
                        actions.push(ClientAction::ReadCharacteristic);
                    }
                    Err(()) => actions.extend(self.disconnect()),
                }
                actions
            }
            (ClientState::WritingOwnKey, ClientEvent::WriteTimeout) => {
                warn!(peer = %self.peer_address, "write acknowledgement timed out");
                self.disconnect()
            }
            (state, event) => {
                warn!(peer = %self.peer_address, ?state, ?event, "unexpected event, ignoring");
                Vec::new()
            }
        }
    }

    fn disconnect(&mut self) -> Vec<ClientAction> {
        self.state = ClientState::Disconnecting;
        vec![ClientAction::Disconnect]
    }

    /// Round-2 write acknowledged: emit the event taken from the round-1
    /// decode and tear down. Proximity was evaluated but does not gate
    /// emission.
    fn finish(&mut self) -> Vec<ClientAction> {
        let mut actions = Vec::new();
        if let Some(peer_key) = self.peer_public_key.clone() {
            info!(
                peer = %self.peer_address,
                proximity = ?self.proximity,
                "handshake complete"
            );
            actions.push(ClientAction::Emit(ConnectionEvent {
                initiator: true,
                peer_address: self.peer_address.clone(),
                timestamp_ms: now_ms(),
                organization: self.peer_organization.clone(),
                protocol_version: self.peer_version,
                peer_public_key: peer_key,
                rssi: self.rssi,
            }));
        }
        actions.extend(self.disconnect());
        actions
    }

    fn derive_secret(&mut self) -> Result<(), ()> {
        let Some(peer_key) = self.peer_public_key.as_deref() else {
            warn!(peer = %self.peer_address, "no peer key after round 1");
            return Err(());
        };
        let pair = self.ctx.identity.key_pair(now_epoch_sec());
        match compute_shared_secret(pair.secret(), peer_key) {
            Ok(secret) => {
                debug!(peer = %self.peer_address, "client: shared secret derived");
                self.secret = Some(secret);
                Ok(())
            }
            Err(e) => {
                warn!(peer = %self.peer_address, error = %e, "client: bad peer key");
                Err(())
            }
        }
    }

    fn process_read(&mut self, bytes: &[u8]) {
        let message = match unframe(bytes) {
            Ok(Unframed::Complete(m)) => m,
            Ok(Unframed::NeedMoreData) => {
                warn!(peer = %self.peer_address, "truncated read response");
                return;
            }
            Err(e) => {
                warn!(peer = %self.peer_address, error = %e, "undecodable read response");
                return;
            }
        };

        if message.is_key_only() {
            // Round 1: the peer's key plus the fields the event will carry.
            info!(
                peer = %self.peer_address,
                key = %hex::encode(&message.public_key[..message.public_key.len().min(8)]),
                "client: received peer key"
            );
            self.peer_public_key = Some(message.public_key);
            self.peer_organization = message.organization;
            self.peer_version = message.version;
            return;
        }

        // Round 2: open the peer's attestation and evaluate co-presence.
        let Some(secret) = self.secret.as_ref() else {
            warn!(peer = %self.peer_address, "attestation before key exchange");
            return;
        };
        let peer_attestation = match crypto::open(secret, &message.encounter)
            .map_err(|e| e.to_string())
            .and_then(|b| Attestation::decode(&b).map_err(|e| e.to_string()))
        {
            Ok(a) => a,
            Err(e) => {
                warn!(peer = %self.peer_address, error = %e, "client: attestation rejected");
                return;
            }
        };
        if let Some(local) = self.ctx.attestations.sample() {
            let proximate = check_proximity(&local, &peer_attestation, self.ctx.earth_radius_km);
            info!(peer = %self.peer_address, proximate, "client: proximity evaluated");
            self.proximity = Some(proximate);
        }
    }

    /// Build and send our own message: always our key, plus a sealed fresh
    /// attestation once a shared secret exists.
    fn write_own_key(&mut self) -> Vec<ClientAction> {
        let encounter = match (&self.secret, self.ctx.attestations.sample()) {
            (Some(secret), Some(attestation)) => {
                match crypto::seal(secret, &attestation.encode()) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        warn!(peer = %self.peer_address, error = %e, "client: seal failed, sending key only");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };
        let pair = self.ctx.identity.key_pair(now_epoch_sec());
        let message = HandshakeMessage {
            version: PROTOCOL_VERSION,
            organization: self.ctx.organization.clone(),
            public_key: pair.public_bytes().to_vec(),
            encounter,
        };
        match frame(&message) {
            Ok(bytes) => {
                self.state = ClientState::WritingOwnKey;
                vec![
                    ClientAction::WriteCharacteristic(bytes),
                    ClientAction::ArmWriteTimeout(WRITE_ACK_TIMEOUT),
                ]
            }
            Err(e) => {
                warn!(peer = %self.peer_address, error = %e, "cannot frame own message");
                self.disconnect()
            }
        }
    }
}

/// Drive one connection attempt to completion over a live link.
///
/// The link is already connected when this is called; the driver feeds the
/// machine [`ClientEvent::Connected`] and then executes actions until the
/// machine releases. The write-acknowledgement timer is realized here by
/// bounding the write call with [`WRITE_ACK_TIMEOUT`], so the machine's
/// arm/cancel actions need no separate timer plumbing.
pub async fn drive(
    mut link: Box<dyn GattLink>,
    mut machine: HandshakeClient,
    events: &UnboundedSender<ConnectionEvent>,
) {
    let mut queue = std::collections::VecDeque::new();
    queue.extend(machine.handle(ClientEvent::Connected));

    while let Some(action) = queue.pop_front() {
        match action {
            ClientAction::NegotiateMtu(mtu) => {
                let granted = link.request_mtu(mtu).await.ok();
                queue.extend(machine.handle(ClientEvent::MtuNegotiated(granted)));
            }
            ClientAction::DiscoverServices => {
                let ok = link.discover_service().await.is_ok();
                queue.extend(machine.handle(ClientEvent::ServicesDiscovered { ok }));
            }
            ClientAction::ReadCharacteristic => {
                let response = link.read_characteristic().await.ok();
                queue.extend(machine.handle(ClientEvent::CharacteristicRead(response)));
            }
            ClientAction::WriteCharacteristic(bytes) => {
                let event =
                    match tokio::time::timeout(WRITE_ACK_TIMEOUT, link.write_characteristic(&bytes))
                        .await
                    {
                        Ok(Ok(())) => ClientEvent::WriteAcknowledged,
                        Ok(Err(_)) => {
                            // A failed write abandons the attempt like any
                            // other step failure.
                            link.disconnect().await;
                            ClientEvent::Disconnected
                        }
                        Err(_) => ClientEvent::WriteTimeout,
                    };
                queue.extend(machine.handle(event));
            }
            // The timeout is bound to the write call above.
            ClientAction::ArmWriteTimeout(_) | ClientAction::CancelWriteTimeout => {}
            ClientAction::Disconnect => {
                link.disconnect().await;
                queue.extend(machine.handle(ClientEvent::Disconnected));
            }
            ClientAction::Emit(event) => {
                let _ = events.send(event);
            }
            ClientAction::Release => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::DEFAULT_EARTH_RADIUS_KM;
    use crate::handshake::AttestationSource;
    use crate::identity::{IdentityProvider, KeyPair};

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

    fn test_ctx() -> HandshakeContext {
        HandshakeContext {
            identity: Arc::new(IdentityProvider::new(900)),
            attestations: Arc::new(FixedSource(Attestation::new(
                1_600_000_000_000,
                48.8584,
                2.2945,
            ))),
            organization: "org-client".to_string(),
            earth_radius_km: DEFAULT_EARTH_RADIUS_KM,
        }
    }

    fn peer_key_frame(pair: &KeyPair) -> Vec<u8> {
        frame(&HandshakeMessage {
            version: PROTOCOL_VERSION,
            organization: "org-peer".to_string(),
            public_key: pair.public_bytes().to_vec(),
            encounter: Vec::new(),
        })
        .expect("Framing should succeed")
    }

    #[test]
    fn test_happy_path_round1_actions() {
        let mut machine = HandshakeClient::new(test_ctx(), "aa:bb".to_string(), -40);
        let peer = KeyPair::generate();

        assert_eq!(
            machine.handle(ClientEvent::Connected),
            vec![ClientAction::NegotiateMtu(REQUESTED_MTU)]
        );
        assert_eq!(
            machine.handle(ClientEvent::MtuNegotiated(Some(80))),
            vec![ClientAction::DiscoverServices]
        );
        assert_eq!(
            machine.handle(ClientEvent::ServicesDiscovered { ok: true }),
            vec![ClientAction::ReadCharacteristic]
        );

        let actions = machine.handle(ClientEvent::CharacteristicRead(Some(peer_key_frame(&peer))));
        assert!(matches!(actions[0], ClientAction::WriteCharacteristic(_)));
        assert_eq!(actions[1], ClientAction::ArmWriteTimeout(WRITE_ACK_TIMEOUT));
        assert_eq!(machine.state(), ClientState::WritingOwnKey);

        // Round-1 write carries no encounter yet.
        let ClientAction::WriteCharacteristic(bytes) = &actions[0] else {
            unreachable!()
        };
        match unframe(bytes).expect("Should decode") {
            Unframed::Complete(m) => assert!(m.is_key_only()),
            other => panic!("Expected complete frame, got {other:?}"),
        }
    }

    #[test]
    fn test_round1_ack_loops_back_to_read() {
        let mut machine = HandshakeClient::new(test_ctx(), "aa:bb".to_string(), -40);
        let peer = KeyPair::generate();

        machine.handle(ClientEvent::Connected);
        machine.handle(ClientEvent::MtuNegotiated(None));
        machine.handle(ClientEvent::ServicesDiscovered { ok: true });
        machine.handle(ClientEvent::CharacteristicRead(Some(peer_key_frame(&peer))));

        let actions = machine.handle(ClientEvent::WriteAcknowledged);
        assert_eq!(actions[0], ClientAction::CancelWriteTimeout);
        assert_eq!(actions[1], ClientAction::ReadCharacteristic);
        assert_eq!(machine.state(), ClientState::ReadingPeerKey);
    }

    #[test]
    fn test_mtu_refusal_is_not_fatal() {
        let mut machine = HandshakeClient::new(test_ctx(), "aa:bb".to_string(), -40);
        machine.handle(ClientEvent::Connected);
        assert_eq!(
            machine.handle(ClientEvent::MtuNegotiated(None)),
            vec![ClientAction::DiscoverServices]
        );
    }

    #[test]
    fn test_discovery_failure_disconnects() {
        let mut machine = HandshakeClient::new(test_ctx(), "aa:bb".to_string(), -40);
        machine.handle(ClientEvent::Connected);
        machine.handle(ClientEvent::MtuNegotiated(Some(80)));
        assert_eq!(
            machine.handle(ClientEvent::ServicesDiscovered { ok: false }),
            vec![ClientAction::Disconnect]
        );
        assert_eq!(machine.state(), ClientState::Disconnecting);
    }

    #[test]
    fn test_read_failure_disconnects() {
        let mut machine = HandshakeClient::new(test_ctx(), "aa:bb".to_string(), -40);
        machine.handle(ClientEvent::Connected);
        machine.handle(ClientEvent::MtuNegotiated(Some(80)));
        machine.handle(ClientEvent::ServicesDiscovered { ok: true });
        assert_eq!(
            machine.handle(ClientEvent::CharacteristicRead(None)),
            vec![ClientAction::Disconnect]
        );
    }

    #[test]
    fn test_write_timeout_disconnects() {
        let mut machine = HandshakeClient::new(test_ctx(), "aa:bb".to_string(), -40);
        let peer = KeyPair::generate();
        machine.handle(ClientEvent::Connected);
        machine.handle(ClientEvent::MtuNegotiated(Some(80)));
        machine.handle(ClientEvent::ServicesDiscovered { ok: true });
        machine.handle(ClientEvent::CharacteristicRead(Some(peer_key_frame(&peer))));

        assert_eq!(
            machine.handle(ClientEvent::WriteTimeout),
            vec![ClientAction::Disconnect]
        );
        assert_eq!(
            machine.handle(ClientEvent::Disconnected),
            vec![ClientAction::Release]
        );
        assert_eq!(machine.state(), ClientState::Released);
    }

    #[test]
    fn test_disconnect_in_any_state_releases() {
        let mut machine = HandshakeClient::new(test_ctx(), "aa:bb".to_string(), -40);
        assert_eq!(
            machine.handle(ClientEvent::Disconnected),
            vec![ClientAction::Release]
        );
        assert_eq!(machine.state(), ClientState::Released);
    }

    #[test]
    fn test_malformed_read_still_writes_own_key() {
        let mut machine = HandshakeClient::new(test_ctx(), "aa:bb".to_string(), -40);
        machine.handle(ClientEvent::Connected);
        machine.handle(ClientEvent::MtuNegotiated(Some(80)));
        machine.handle(ClientEvent::ServicesDiscovered { ok: true });

        let actions = machine.handle(ClientEvent::CharacteristicRead(Some(vec![0x02, 1, 0xff])));
        assert!(matches!(actions[0], ClientAction::WriteCharacteristic(_)));
    }

    #[test]
    fn test_round1_ack_without_peer_key_disconnects() {
        // Peer responded with garbage, so no key was stored; after our
        // write is acknowledged there is nothing to derive a secret from.
        let mut machine = HandshakeClient::new(test_ctx(), "aa:bb".to_string(), -40);
        machine.handle(ClientEvent::Connected);
        machine.handle(ClientEvent::MtuNegotiated(Some(80)));
        machine.handle(ClientEvent::ServicesDiscovered { ok: true });
        machine.handle(ClientEvent::CharacteristicRead(Some(vec![0x02, 1, 0xff])));

        let actions = machine.handle(ClientEvent::WriteAcknowledged);
        assert_eq!(actions[0], ClientAction::CancelWriteTimeout);
        assert_eq!(actions[1], ClientAction::Disconnect);
    }

    #[test]
    fn test_round2_write_is_key_only_without_sealable_attestation() {
        let ctx = HandshakeContext {
            identity: Arc::new(IdentityProvider::new(900)),
            attestations: Arc::new(NoFixSource),
            organization: "org-client".to_string(),
            earth_radius_km: DEFAULT_EARTH_RADIUS_KM,
        };
        let mut machine = HandshakeClient::new(ctx, "aa:bb".to_string(), -40);
        let peer = KeyPair::generate();

        machine.handle(ClientEvent::Connected);
        machine.handle(ClientEvent::MtuNegotiated(Some(80)));
        machine.handle(ClientEvent::ServicesDiscovered { ok: true });
        machine.handle(ClientEvent::CharacteristicRead(Some(peer_key_frame(&peer))));
        machine.handle(ClientEvent::WriteAcknowledged);

        // A secret exists, but nothing sealable; the round-2 write must
        // still go out key-only rather than abort the attempt.
        let actions =
            machine.handle(ClientEvent::CharacteristicRead(Some(peer_key_frame(&peer))));
        let ClientAction::WriteCharacteristic(bytes) = &actions[0] else {
            panic!("Expected write, got {:?}", actions[0]);
        };
        match unframe(bytes).expect("Should decode") {
            Unframed::Complete(m) => assert!(m.is_key_only()),
            other => panic!("Expected complete frame, got {other:?}"),
        }
    }

    #[test]
    fn test_full_two_round_exchange_emits_one_event() {
        let mut machine = HandshakeClient::new(test_ctx(), "aa:bb".to_string(), -40);
        let peer = KeyPair::generate();

        machine.handle(ClientEvent::Connected);
        machine.handle(ClientEvent::MtuNegotiated(Some(80)));
        machine.handle(ClientEvent::ServicesDiscovered { ok: true });
        machine.handle(ClientEvent::CharacteristicRead(Some(peer_key_frame(&peer))));
        machine.handle(ClientEvent::WriteAcknowledged);

        // Round 2: the peer answers with a sealed attestation. Both sides
        // hold the same secret after round 1, so seal with the machine's.
        let machine_secret = machine.secret.clone().expect("Secret after round 1");
        let attestation = Attestation::new(1_600_000_010_000, 48.8584, 2.2945);
        let sealed =
            crypto::seal(&machine_secret, &attestation.encode()).expect("Sealing should succeed");
        let round2 = frame(&HandshakeMessage {
            version: PROTOCOL_VERSION,
            organization: "org-peer".to_string(),
            public_key: peer.public_bytes().to_vec(),
            encounter: sealed,
        })
        .expect("Framing should succeed");

        let actions = machine.handle(ClientEvent::CharacteristicRead(Some(round2)));
        assert!(matches!(actions[0], ClientAction::WriteCharacteristic(_)));

        let finish = machine.handle(ClientEvent::WriteAcknowledged);
        assert_eq!(finish[0], ClientAction::CancelWriteTimeout);
        let ClientAction::Emit(event) = &finish[1] else {
            panic!("Expected Emit, got {:?}", finish[1]);
        };
        assert!(event.initiator);
        assert_eq!(event.peer_address, "aa:bb");
        assert_eq!(event.organization, "org-peer");
        assert_eq!(event.peer_public_key, peer.public_bytes().to_vec());
        assert_eq!(event.rssi, -40);
        assert_eq!(finish[2], ClientAction::Disconnect);

        assert_eq!(machine.proximity(), Some(true));
    }
}
