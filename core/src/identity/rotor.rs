// Ephemeral seed rotation for identifier unlinkability.
//
// A fixed master seed alone would make every derived identifier linkable
// across time. The rotor prepends a fresh random seed every rotation
// interval and mixes the newest one with the master seed through a keyed
// hash, so the derived material changes each interval even though the
// master seed never does.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long an ephemeral seed stays newest (15 minutes).
pub const ROTATION_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Ephemeral seed length in bytes.
pub const SEED_SIZE: usize = 16;

/// Holds the master seed and the ordered ephemeral seed list, newest first.
///
/// The list only grows; callers that care about memory trim their own
/// snapshots. Every accessor takes the lock briefly and never blocks on I/O.
pub struct EphemeralRotor {
    master_seed: [u8; 32],
    seeds: Mutex<Vec<[u8; SEED_SIZE]>>,
}

impl EphemeralRotor {
    /// Create a rotor with an immediate first seed, so `randomness` is
    /// usable before the first interval elapses.
    pub fn new(master_seed: [u8; 32]) -> Self {
        let rotor = Self {
            master_seed,
            seeds: Mutex::new(Vec::new()),
        };
        rotor.rotate();
        rotor
    }

    /// Generate a fresh ephemeral seed and prepend it.
    pub fn rotate(&self) {
        let mut seed = [0u8; SEED_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let mut seeds = self.seeds.lock();
        seeds.insert(0, seed);
        debug!(generation = seeds.len(), "rotated ephemeral seed");
    }

    /// Keyed hash of the master seed over the newest ephemeral seed.
    /// Changes every rotation interval.
    pub fn randomness(&self) -> [u8; 32] {
        let seeds = self.seeds.lock();
        // Constructor guarantees at least one seed.
        *blake3::keyed_hash(&self.master_seed, &seeds[0]).as_bytes()
    }

    /// Snapshot of the ephemeral seeds, newest first.
    pub fn seeds(&self) -> Vec<[u8; SEED_SIZE]> {
        self.seeds.lock().clone()
    }

    /// Drive rotation on a fixed interval until the handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ROTATION_INTERVAL);
            // First tick fires immediately; the constructor already seeded.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.rotate();
            }
        })
    }
}
