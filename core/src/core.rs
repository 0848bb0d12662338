// Core orchestrator.
//
// Owns configuration, identity, and the ephemeral rotor; wires the external
// collaborators together: the GPS stream feeds the position tracker, the
// discovery stream feeds the dial loop, and both handshake roles funnel
// completed exchanges into one unbounded output queue the persistence
// collaborator consumes. Nothing here stores events or scores risk.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::encounter::Attestation;
use crate::handshake::client::{drive, HandshakeClient};
use crate::handshake::link::LinkFactory;
use crate::handshake::server::ResponderServer;
use crate::handshake::{now_ms, AttestationSource, ConnectionEvent, HandshakeContext};
use crate::identity::rotor::EphemeralRotor;
use crate::identity::{derive_key_pair_from_seed, IdentityProvider, KeyPair};
use crate::CoreError;

/// One sample from the external GPS collaborator. The geohash arrives
/// pre-computed at the collaborator's fixed precision.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: i64,
    pub geohash: String,
}

/// One advertisement from the external BLE discovery collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub address: String,
    pub rssi: i8,
}

/// Holds the last known fix and serves freshly timestamped attestations
/// from it.
#[derive(Default)]
pub struct PositionTracker {
    last: RwLock<Option<PositionFix>>,
}

impl PositionTracker {
    pub fn update(&self, fix: PositionFix) {
        *self.last.write() = Some(fix);
    }

    pub fn last_geohash(&self) -> Option<String> {
        self.last.read().as_ref().map(|fix| fix.geohash.clone())
    }
}

impl AttestationSource for PositionTracker {
    /// Attestations carry the moment of the handshake, not the moment of
    /// the fix, paired with the last known coordinates.
    fn sample(&self) -> Option<Attestation> {
        self.last
            .read()
            .as_ref()
            .map(|fix| Attestation::new(now_ms(), fix.latitude, fix.longitude))
    }
}

struct Running {
    server: Arc<ResponderServer>,
    shutdown: watch::Sender<bool>,
    dial_task: JoinHandle<()>,
    position_task: JoinHandle<()>,
    rotor_task: JoinHandle<()>,
}

/// The proximity-detection core.
pub struct Core {
    config: ProtocolConfig,
    identity: Arc<IdentityProvider>,
    rotor: Arc<EphemeralRotor>,
    position: Arc<PositionTracker>,
    running: Mutex<Option<Running>>,
}

impl Core {
    pub fn new(config: ProtocolConfig, master_seed: [u8; 32]) -> Self {
        let identity = Arc::new(IdentityProvider::new(config.key_validity_secs));
        Self {
            config,
            identity,
            rotor: Arc::new(EphemeralRotor::new(master_seed)),
            position: Arc::new(PositionTracker::default()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Geohash of the last GPS fix, for coarse tagging of stored events.
    pub fn last_geohash(&self) -> Option<String> {
        self.position.last_geohash()
    }

    /// Reproducible identity bound to the current rotation epoch: the
    /// rotor's mixed randomness seeds the key derivation, so the pair
    /// changes every rotation interval without touching the master seed.
    pub fn ephemeral_identity(&self) -> KeyPair {
        derive_key_pair_from_seed(&self.rotor.randomness())
    }

    /// The responder the platform routes GATT server callbacks into, once
    /// started.
    pub fn responder(&self) -> Option<Arc<ResponderServer>> {
        self.running.lock().as_ref().map(|r| r.server.clone())
    }

    /// Start serving and dialing.
    ///
    /// `positions` and `peers` are the collaborator streams; `links` opens
    /// initiator connections. Returns the output queue of completed
    /// exchanges. Must be called within a tokio runtime.
    pub fn start(
        &self,
        positions: UnboundedReceiver<PositionFix>,
        peers: UnboundedReceiver<DiscoveredPeer>,
        links: Arc<dyn LinkFactory>,
    ) -> Result<UnboundedReceiver<ConnectionEvent>, CoreError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(CoreError::AlreadyStarted);
        }
        info!(organization = %self.config.organization, "starting proximity core");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let ctx = HandshakeContext {
            identity: self.identity.clone(),
            attestations: self.position.clone(),
            organization: self.config.organization.clone(),
            earth_radius_km: self.config.earth_radius_km,
        };

        let server = Arc::new(ResponderServer::new(ctx.clone(), events_tx.clone()));
        let position_task = tokio::spawn(track_positions(self.position.clone(), positions));
        let rotor_task = self.rotor.clone().spawn();
        let dial_task = tokio::spawn(dial_loop(ctx, links, peers, events_tx, shutdown_rx));

        *running = Some(Running {
            server,
            shutdown,
            dial_task,
            position_task,
            rotor_task,
        });
        Ok(events_rx)
    }

    /// Stop the feeds and wait for in-flight handshakes to finish
    /// naturally; aborting them would leak platform connection handles.
    pub async fn stop(&self) -> Result<(), CoreError> {
        let running = self.running.lock().take().ok_or(CoreError::NotStarted)?;
        info!("stopping proximity core");

        running.position_task.abort();
        running.rotor_task.abort();
        let _ = running.shutdown.send(true);
        if running.dial_task.await.is_err() {
            warn!("dial loop ended abnormally");
        }
        // Dropping the Running (and with it the server's event sender)
        // closes the output queue.
        Ok(())
    }
}

async fn track_positions(
    tracker: Arc<PositionTracker>,
    mut positions: UnboundedReceiver<PositionFix>,
) {
    while let Some(fix) = positions.recv().await {
        debug!(geohash = %fix.geohash, "position updated");
        tracker.update(fix);
    }
}

/// Consume discovered peers and run one independent handshake task per
/// peer. A bad peer fails its own task and nothing else.
async fn dial_loop(
    ctx: HandshakeContext,
    links: Arc<dyn LinkFactory>,
    mut peers: UnboundedReceiver<DiscoveredPeer>,
    events: tokio::sync::mpsc::UnboundedSender<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe_peer = peers.recv() => {
                let Some(peer) = maybe_peer else { break };
                let ctx = ctx.clone();
                let links = links.clone();
                let events = events.clone();
                handshakes.spawn(async move {
                    debug!(peer = %peer.address, rssi = peer.rssi, "dialing");
                    match links.open(&peer.address).await {
                        Ok(link) => {
                            let machine = HandshakeClient::new(ctx, peer.address, peer.rssi);
                            drive(link, machine, &events).await;
                        }
                        Err(e) => debug!(error = %e, "dial failed"),
                    }
                });
            }
        }
    }
    // Let in-flight handshakes run to completion.
    while handshakes.join_next().await.is_some() {}
}
