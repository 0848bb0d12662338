// Attestation sealing: Blake3 KDF over the ECDH secret + XChaCha20-Poly1305.
//
// Flow per connection:
// 1. ECDH (identity module) yields a SharedSecret, used exactly once
// 2. KDF: blake3::derive_key(shared_secret) -> symmetric key
// 3. Seal: XChaCha20-Poly1305(symmetric_key, random_nonce, attestation)
// 4. Output: nonce || ciphertext, carried in the frame's encounter field

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// KDF context string binding derived keys to this protocol.
/// Changing this breaks compatibility with every deployed peer.
const KDF_CONTEXT: &str = "murmur v1 attestation sealing 2026-08";

/// XChaCha20 nonce length, prepended to every sealed attestation.
const NONCE_SIZE: usize = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("sealing failed")]
    SealFailed,
    #[error("opening failed: wrong key or tampered ciphertext")]
    OpenFailed,
    #[error("sealed attestation too short")]
    Truncated,
}

/// Raw ECDH output. Wiped on drop, never persisted, consumed once per
/// connection to derive the sealing key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub(crate) [u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn sealing_key(&self) -> [u8; 32] {
        blake3::derive_key(KDF_CONTEXT, &self.0)
    }
}

/// Encrypt an attestation under the connection's shared secret.
/// Output is `nonce || ciphertext+tag`.
pub fn seal(secret: &SharedSecret, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut key = secret.sealing_key();
    let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::SealFailed)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::SealFailed)?;
    key.zeroize();

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a sealed attestation produced by [`seal`] on the peer side.
pub fn open(secret: &SharedSecret, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE {
        return Err(CryptoError::Truncated);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);

    let mut key = secret.sealing_key();
    let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::OpenFailed)?;
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::OpenFailed)?;
    key.zeroize();

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encounter::Attestation;

    fn secret(byte: u8) -> SharedSecret {
        SharedSecret::from_bytes([byte; 32])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let attestation = Attestation::new(1_600_000_000_000, 48.8584, 2.2945);
        let sealed = seal(&secret(0x42), &attestation.encode()).expect("Sealing should succeed");
        let opened = open(&secret(0x42), &sealed).expect("Opening should succeed");
        assert_eq!(
            Attestation::decode(&opened).expect("Should decode"),
            attestation
        );
    }

    #[test]
    fn test_wrong_secret_fails() {
        let sealed = seal(&secret(0x42), b"attestation bytes").expect("Sealing should succeed");
        assert_eq!(open(&secret(0x43), &sealed), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut sealed = seal(&secret(0x42), b"attestation bytes").expect("Sealing should succeed");
        if let Some(byte) = sealed.last_mut() {
            *byte ^= 0xff;
        }
        assert_eq!(open(&secret(0x42), &sealed), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn test_truncated_input_fails() {
        assert_eq!(
            open(&secret(0x42), &[0u8; NONCE_SIZE - 1]),
            Err(CryptoError::Truncated)
        );
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let plaintext = b"attestation bytes";
        let a = seal(&secret(0x42), plaintext).expect("Sealing should succeed");
        let b = seal(&secret(0x42), plaintext).expect("Sealing should succeed");
        assert_ne!(a, b);
    }
}
