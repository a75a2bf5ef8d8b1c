//! Wire protocol: type-tagged UDP datagrams with bincode bodies.
//!
//! Frame layout is `[1-byte type][body]`. Handshake and reject frames are
//! cleartext (the handshake carries its own detached signature); every other
//! body is sealed with the peer's session cipher.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::{Algorithm, CryptoError, SessionCipher};
use crate::peers::PeerId;
use crate::signature::{Signature, KEY_HASH_LEN, SALT_LEN};

pub const TYPE_HANDSHAKE: u8 = 1;
pub const TYPE_REJECT: u8 = 2;
pub const TYPE_IP_LEASE: u8 = 3;
pub const TYPE_HEARTBEAT: u8 = 5;
pub const TYPE_DATA: u8 = 9;
pub const TYPE_PEER_QUERY: u8 = 0x20;
pub const TYPE_CLOSE: u8 = 0xFF;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("signature verification failed")]
    SignatureVerifyFailed,
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Handshake request: the requester's identity, ephemeral ECDH public key,
/// salted hash binding the signer's public key, and the advertised cipher
/// candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub id: PeerId,
    pub public_key: [u8; 32],
    pub public_key_hash: [u8; KEY_HASH_LEN],
    pub public_key_salt: [u8; SALT_LEN],
    pub algorithms: Vec<Algorithm>,
}

/// Handshake response: mirrors the request fields, fixes the selected
/// cipher, and teaches the requester the overlay subnet and (optionally) the
/// responder's own overlay address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub id: PeerId,
    pub public_key: [u8; 32],
    pub public_key_hash: [u8; KEY_HASH_LEN],
    pub public_key_salt: [u8; SALT_LEN],
    pub algorithm: Algorithm,
    pub cidr: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandshakePayload {
    Request(HandshakeRequest),
    Response(HandshakeResponse),
}

/// Outer handshake envelope: a detached signature over the bincode of the
/// inner request or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeEnvelope {
    pub signature: Vec<u8>,
    pub payload: HandshakePayload,
}

/// Heartbeat body (type 5). Carries the sender identity and a unix-seconds
/// timestamp, used for both RTT and liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Heartbeat {
    Ping { id: PeerId, ts: u32 },
    Pong { id: PeerId, ts: u32 },
}

/// IP lease body (type 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IpLease {
    Request { id: PeerId, ip: Option<String> },
    Response { id: PeerId, ip: String },
}

/// Peer query body (type 0x20): ask the supernode for a peer's NAT endpoint
/// so a direct path can be attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerQuery {
    Request {
        id: PeerId,
        ip: String,
    },
    Response {
        id: PeerId,
        ip: String,
        nat_ip: String,
        nat_port: u16,
    },
}

/// Graceful teardown notice (type 0xFF).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Close {
    pub id: PeerId,
}

fn frame(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(kind);
    out.extend_from_slice(body);
    out
}

fn sign_payload(
    signature: &Signature,
    payload: HandshakePayload,
) -> Result<Vec<u8>, ProtocolError> {
    let inner = match &payload {
        HandshakePayload::Request(r) => bincode::serialize(r),
        HandshakePayload::Response(r) => bincode::serialize(r),
    }
    .map_err(ProtocolError::Encode)?;
    let envelope = HandshakeEnvelope {
        signature: signature.sign(&inner),
        payload,
    };
    let body = bincode::serialize(&envelope).map_err(ProtocolError::Encode)?;
    Ok(frame(TYPE_HANDSHAKE, &body))
}

pub fn build_handshake_request(
    signature: &Signature,
    id: PeerId,
    public_key: [u8; 32],
    algorithms: &[Algorithm],
) -> Result<Vec<u8>, ProtocolError> {
    let salt = Signature::random_salt();
    let hash = Signature::calculate_hash(&signature.public_key_bytes(), &salt);
    sign_payload(
        signature,
        HandshakePayload::Request(HandshakeRequest {
            id,
            public_key,
            public_key_hash: hash,
            public_key_salt: salt,
            algorithms: algorithms.to_vec(),
        }),
    )
}

pub fn build_handshake_response(
    signature: &Signature,
    id: PeerId,
    public_key: [u8; 32],
    algorithm: Algorithm,
    cidr: Option<String>,
    gateway: Option<String>,
) -> Result<Vec<u8>, ProtocolError> {
    let salt = Signature::random_salt();
    let hash = Signature::calculate_hash(&signature.public_key_bytes(), &salt);
    sign_payload(
        signature,
        HandshakePayload::Response(HandshakeResponse {
            id,
            public_key,
            public_key_hash: hash,
            public_key_salt: salt,
            algorithm,
            cidr,
            gateway,
        }),
    )
}

/// Parse and authenticate a handshake body (the frame minus its type byte).
/// The embedded key hash is checked before the signature, so a substituted
/// signing key fails fast.
pub fn parse_handshake(
    signature: &Signature,
    body: &[u8],
) -> Result<HandshakePayload, ProtocolError> {
    let envelope: HandshakeEnvelope =
        bincode::deserialize(body).map_err(ProtocolError::Decode)?;
    let (salt, hash, inner) = match &envelope.payload {
        HandshakePayload::Request(r) => (
            r.public_key_salt,
            r.public_key_hash,
            bincode::serialize(r).map_err(ProtocolError::Encode)?,
        ),
        HandshakePayload::Response(r) => (
            r.public_key_salt,
            r.public_key_hash,
            bincode::serialize(r).map_err(ProtocolError::Encode)?,
        ),
    };
    if !signature.verify(&salt, &hash, &envelope.signature, &inner) {
        return Err(ProtocolError::SignatureVerifyFailed);
    }
    Ok(envelope.payload)
}

/// Rejection notice (type 2): tells the requester to redo the handshake.
pub fn build_reject() -> Vec<u8> {
    vec![TYPE_REJECT]
}

fn build_sealed<T: Serialize>(
    kind: u8,
    cipher: &SessionCipher,
    msg: &T,
) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::serialize(msg).map_err(ProtocolError::Encode)?;
    let sealed = cipher.encrypt(&body)?;
    Ok(frame(kind, &sealed))
}

fn parse_sealed<T: DeserializeOwned>(
    cipher: &SessionCipher,
    body: &[u8],
) -> Result<T, ProtocolError> {
    let plain = cipher.decrypt(body)?;
    bincode::deserialize(&plain).map_err(ProtocolError::Decode)
}

pub fn build_ping(cipher: &SessionCipher, id: PeerId, ts: u32) -> Result<Vec<u8>, ProtocolError> {
    build_sealed(TYPE_HEARTBEAT, cipher, &Heartbeat::Ping { id, ts })
}

pub fn build_pong(cipher: &SessionCipher, id: PeerId, ts: u32) -> Result<Vec<u8>, ProtocolError> {
    build_sealed(TYPE_HEARTBEAT, cipher, &Heartbeat::Pong { id, ts })
}

pub fn parse_heartbeat(
    cipher: &SessionCipher,
    body: &[u8],
) -> Result<Heartbeat, ProtocolError> {
    parse_sealed(cipher, body)
}

pub fn build_ip_lease_request(
    cipher: &SessionCipher,
    id: PeerId,
    ip: Option<String>,
) -> Result<Vec<u8>, ProtocolError> {
    build_sealed(TYPE_IP_LEASE, cipher, &IpLease::Request { id, ip })
}

pub fn build_ip_lease_response(
    cipher: &SessionCipher,
    id: PeerId,
    ip: String,
) -> Result<Vec<u8>, ProtocolError> {
    build_sealed(TYPE_IP_LEASE, cipher, &IpLease::Response { id, ip })
}

pub fn parse_ip_lease(cipher: &SessionCipher, body: &[u8]) -> Result<IpLease, ProtocolError> {
    parse_sealed(cipher, body)
}

pub fn build_peer_query_request(
    cipher: &SessionCipher,
    id: PeerId,
    ip: String,
) -> Result<Vec<u8>, ProtocolError> {
    build_sealed(TYPE_PEER_QUERY, cipher, &PeerQuery::Request { id, ip })
}

pub fn build_peer_query_response(
    cipher: &SessionCipher,
    id: PeerId,
    ip: String,
    nat_ip: String,
    nat_port: u16,
) -> Result<Vec<u8>, ProtocolError> {
    build_sealed(
        TYPE_PEER_QUERY,
        cipher,
        &PeerQuery::Response { id, ip, nat_ip, nat_port },
    )
}

pub fn parse_peer_query(
    cipher: &SessionCipher,
    body: &[u8],
) -> Result<PeerQuery, ProtocolError> {
    parse_sealed(cipher, body)
}

/// Data frame (type 9): the raw L3 payload sealed as-is, no bincode.
pub fn build_data(cipher: &SessionCipher, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let sealed = cipher.encrypt(payload)?;
    Ok(frame(TYPE_DATA, &sealed))
}

pub fn build_close(cipher: &SessionCipher, id: PeerId) -> Result<Vec<u8>, ProtocolError> {
    build_sealed(TYPE_CLOSE, cipher, &Close { id })
}

pub fn parse_close(cipher: &SessionCipher, body: &[u8]) -> Result<Close, ProtocolError> {
    parse_sealed(cipher, body)
}
