//! Password-derived signing identity for the handshake.
//!
//! Every node on the same overlay derives the same Ed25519 keypair from the
//! shared network password, so a handshake signed by a stranger fails
//! verification. A salted 4-byte hash of the signer's public key is embedded
//! next to the signature; the receiver recomputes it before running full
//! signature verification, which catches key substitution cheaply.

use ed25519_dalek::{Signer, SigningKey, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const KEY_HASH_LEN: usize = 4;
pub const SALT_LEN: usize = 4;

pub struct Signature {
    signing: SigningKey,
}

impl Signature {
    /// Derive the signing key from the shared password. Hardening the
    /// password (PBKDF2 etc.) is the host's job; the engine only needs the
    /// derivation to be deterministic across nodes.
    pub fn from_password(password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"burrow-identity-v1");
        hasher.update(password.as_bytes());
        let seed: [u8; 32] = hasher.finalize().into();
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Detached signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing.sign(data).to_bytes().to_vec()
    }

    /// Verify an incoming handshake payload: first the cheap hash binding
    /// (the embedded hash must match our own public key under the embedded
    /// salt), then the Ed25519 signature itself.
    pub fn verify(&self, salt: &[u8], hash: &[u8], sig: &[u8], data: &[u8]) -> bool {
        let expected = Self::calculate_hash(&self.public_key_bytes(), salt);
        if expected[..] != hash[..] {
            return false;
        }
        let Ok(sig) = ed25519_dalek::Signature::from_slice(sig) else {
            return false;
        };
        self.signing.verifying_key().verify(data, &sig).is_ok()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// First 4 bytes of `SHA-256(key ‖ salt)`.
    pub fn calculate_hash(key: &[u8], salt: &[u8]) -> [u8; KEY_HASH_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(salt);
        let digest = hasher.finalize();
        let mut out = [0u8; KEY_HASH_LEN];
        out.copy_from_slice(&digest[..KEY_HASH_LEN]);
        out
    }

    pub fn random_salt() -> [u8; SALT_LEN] {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        salt
    }
}
