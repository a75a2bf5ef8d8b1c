//! Session crypto: X25519 key agreement, per-peer AEAD cipher, cipher
//! benchmark and negotiation.

use std::time::{Duration, Instant};

use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

/// Minimum length of a sealed body: 8-byte nonce header + 16-byte tag.
pub const SEALED_OVERHEAD: usize = 24;

/// First byte of every sealed body. The remaining 7 header bytes are the
/// random nonce tail.
const MARKER: u8 = 0;

/// Time budget per cipher when benchmarking at startup.
pub const BENCH_BUDGET: Duration = Duration::from_millis(100);

const BENCH_BLOCK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("ciphertext too short")]
    Truncated,
    #[error("decryption failed")]
    Decrypt,
}

/// The closed set of supported AEAD ciphers. Fixed per peer once negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    pub const ALL: [CipherKind; 3] = [
        CipherKind::Aes128Gcm,
        CipherKind::Aes256Gcm,
        CipherKind::ChaCha20Poly1305,
    ];

    /// Symmetric key length: the ECDH shared secret is truncated to this.
    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => "AES-128-GCM",
            CipherKind::Aes256Gcm => "AES-256-GCM",
            CipherKind::ChaCha20Poly1305 => "CHACHA20-POLY1305",
        }
    }
}

/// A cipher candidate advertised during the handshake: the cipher plus the
/// throughput measured on the advertising node, in MiB/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Algorithm {
    pub kind: CipherKind,
    pub speed: f32,
}

/// X25519 keypair used for per-peer key agreement. One per edge.
pub struct EcdhKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EcdhKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

#[derive(Clone)]
enum CipherImpl {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
    ChaCha(ChaCha20Poly1305),
}

/// Symmetric AEAD cipher for one peer session. Derived once from the ECDH
/// shared secret and never re-keyed for the lifetime of the peer.
#[derive(Clone)]
pub struct SessionCipher {
    kind: CipherKind,
    cipher: CipherImpl,
}

impl SessionCipher {
    /// Derive the session cipher from our private key and the peer's public
    /// key. 128-bit ciphers use the first 16 bytes of the shared secret,
    /// 256-bit ciphers the whole of it.
    pub fn derive(
        keypair: &EcdhKeypair,
        peer_public: &[u8; 32],
        kind: CipherKind,
    ) -> Result<Self, CryptoError> {
        let shared = keypair.secret.diffie_hellman(&PublicKey::from(*peer_public));
        Self::from_key(kind, shared.as_bytes())
    }

    /// Build a cipher directly from 32 bytes of key material (truncated per
    /// cipher). Also used by the benchmark with a throwaway random key.
    pub fn from_key(kind: CipherKind, key: &[u8; 32]) -> Result<Self, CryptoError> {
        let key = &key[..kind.key_len()];
        let cipher = match kind {
            CipherKind::Aes128Gcm => {
                CipherImpl::Aes128(Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::Key)?)
            }
            CipherKind::Aes256Gcm => {
                CipherImpl::Aes256(Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Key)?)
            }
            CipherKind::ChaCha20Poly1305 => CipherImpl::ChaCha(
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?,
            ),
        };
        Ok(Self { kind, cipher })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Seal a plaintext. Layout: marker byte, 7 random nonce bytes, then
    /// ciphertext and 16-byte tag. The AEAD nonce is 5 zero bytes followed by
    /// the 7 random bytes; the tail is drawn fresh from the OS RNG on every
    /// call, so a repeated plaintext never reuses a nonce under the session
    /// key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut tail = [0u8; 7];
        OsRng.fill_bytes(&mut tail);
        let mut nonce = [0u8; 12];
        nonce[5..].copy_from_slice(&tail);

        let sealed = match &self.cipher {
            CipherImpl::Aes128(c) => c.encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext),
            CipherImpl::Aes256(c) => c.encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext),
            CipherImpl::ChaCha(c) => {
                c.encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
            }
        }
        .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(8 + sealed.len());
        out.push(MARKER);
        out.extend_from_slice(&tail);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a sealed body. Anything shorter than [`SEALED_OVERHEAD`] is
    /// rejected before any AEAD work; a tag mismatch is an error, never a
    /// panic.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < SEALED_OVERHEAD {
            return Err(CryptoError::Truncated);
        }
        let mut nonce = [0u8; 12];
        nonce[5..].copy_from_slice(&data[1..8]);
        let sealed = &data[8..];

        match &self.cipher {
            CipherImpl::Aes128(c) => c.decrypt(aes_gcm::Nonce::from_slice(&nonce), sealed),
            CipherImpl::Aes256(c) => c.decrypt(aes_gcm::Nonce::from_slice(&nonce), sealed),
            CipherImpl::ChaCha(c) => {
                c.decrypt(chacha20poly1305::Nonce::from_slice(&nonce), sealed)
            }
        }
        .map_err(|_| CryptoError::Decrypt)
    }
}

/// Encrypt fixed-size blocks under a throwaway key until the time budget
/// elapses; returns throughput in MiB/s.
pub fn measure_throughput(kind: CipherKind, budget: Duration) -> f32 {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    let cipher = match SessionCipher::from_key(kind, &key) {
        Ok(c) => c,
        Err(_) => return 0.0,
    };
    let block = vec![0u8; BENCH_BLOCK];

    let start = Instant::now();
    let mut processed: u64 = 0;
    while start.elapsed() < budget {
        if cipher.encrypt(&block).is_err() {
            return 0.0;
        }
        processed += BENCH_BLOCK as u64;
    }
    let secs = start.elapsed().as_secs_f32();
    if secs == 0.0 {
        return 0.0;
    }
    processed as f32 / (1024.0 * 1024.0) / secs
}

/// Benchmark every supported cipher and return the candidate list ordered by
/// descending throughput. Advertised in the handshake request.
pub fn rank_algorithms() -> Vec<Algorithm> {
    let mut out: Vec<Algorithm> = CipherKind::ALL
        .iter()
        .map(|&kind| Algorithm {
            kind,
            speed: measure_throughput(kind, BENCH_BUDGET),
        })
        .collect();
    out.sort_by(|a, b| b.speed.partial_cmp(&a.speed).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Responder-side cipher selection: the highest-throughput entry in the
/// requester's advertised list that we also support. Ties break toward the
/// earlier list entry.
pub fn select_algorithm(offered: &[Algorithm], supported: &[CipherKind]) -> Option<CipherKind> {
    let mut best: Option<&Algorithm> = None;
    for candidate in offered {
        if !supported.contains(&candidate.kind) {
            continue;
        }
        match best {
            Some(current) if candidate.speed <= current.speed => {}
            _ => best = Some(candidate),
        }
    }
    best.map(|a| a.kind)
}
