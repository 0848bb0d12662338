// Identity and key provisioning.
//
// Session keys are X25519 pairs scoped to a time bucket: the same pair is
// served for the whole validity window and a fresh one after rollover, so
// a device is unlinkable across windows but stable within one. Seed-bound
// derivation provides reproducible identities for the rotation layer.

pub mod rotor;

use std::collections::HashMap;

use curve25519_dalek::scalar::Scalar;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use thiserror::Error;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::SharedSecret;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid peer public key: {0}")]
    InvalidKey(String),
}

/// An X25519 key pair. Callers receive clones; the provider's cache is the
/// only place a private key lives between calls.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

/// Compute the ECDH shared secret between our private key and a peer's
/// public key as received off the wire.
///
/// Rejects keys of the wrong length and low-order points whose exchange
/// contributes nothing from our side.
pub fn compute_shared_secret(
    local: &StaticSecret,
    peer_public: &[u8],
) -> Result<SharedSecret, IdentityError> {
    let bytes: [u8; 32] = peer_public
        .try_into()
        .map_err(|_| IdentityError::InvalidKey(format!("{} bytes", peer_public.len())))?;
    let shared = local.diffie_hellman(&PublicKey::from(bytes));
    if !shared.was_contributory() {
        return Err(IdentityError::InvalidKey("low-order point".to_string()));
    }
    Ok(SharedSecret::from_bytes(shared.to_bytes()))
}

/// Derive a key pair deterministically from seed material.
///
/// The seed's leading bytes are interpreted as an integer that seeds a
/// deterministic generator; candidate scalars are rejection-sampled until
/// one falls below the group order, then clamped into an X25519 secret.
pub fn derive_key_pair_from_seed(seed: &[u8]) -> KeyPair {
    let mut numeric = [0u8; 8];
    let take = seed.len().min(8);
    numeric[..take].copy_from_slice(&seed[..take]);
    let mut rng = StdRng::seed_from_u64(u64::from_be_bytes(numeric));

    let mut candidate = [0u8; 32];
    loop {
        rng.fill_bytes(&mut candidate);
        if bool::from(Scalar::from_canonical_bytes(candidate).is_some()) {
            break;
        }
    }

    let secret = StaticSecret::from(candidate);
    let public = PublicKey::from(&secret);
    KeyPair { secret, public }
}

/// Serves the device's session key pair for the current time bucket.
pub struct IdentityProvider {
    validity_secs: u64,
    cache: RwLock<HashMap<u64, KeyPair>>,
}

impl IdentityProvider {
    pub fn new(validity_secs: u64) -> Self {
        Self {
            validity_secs: validity_secs.max(1),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn bucket(&self, now_epoch_sec: u64) -> u64 {
        now_epoch_sec / self.validity_secs
    }

    /// The key pair for the bucket containing `now_epoch_sec`. Stable for
    /// the whole validity window, fresh after rollover. Old buckets stay
    /// cached so late round-2 exchanges can still complete.
    pub fn key_pair(&self, now_epoch_sec: u64) -> KeyPair {
        let bucket = self.bucket(now_epoch_sec);
        if let Some(pair) = self.cache.read().get(&bucket) {
            return pair.clone();
        }
        let mut cache = self.cache.write();
        cache
            .entry(bucket)
            .or_insert_with(|| {
                debug!(bucket, "rotating session key pair");
                KeyPair::generate()
            })
            .clone()
    }
}
