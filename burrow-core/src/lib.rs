//! Burrow overlay protocol reference implementation.
//! Host-driven: no I/O; the host passes datagrams, timer ticks, and outbound
//! packets in, and drains the returned actions.

pub mod crypto;
pub mod edge;
pub mod ip_packet;
pub mod peers;
pub mod protocol;
pub mod signature;

pub use crypto::{Algorithm, CipherKind, EcdhKeypair, SessionCipher};
pub use edge::{Action, Edge, EdgeConfig, HANDSHAKE_INTERVAL_SECS, HEARTBEAT_INTERVAL_SECS};
pub use ip_packet::IpPacket;
pub use peers::{Peer, PeerId, Peers, PendingPeer};
pub use protocol::ProtocolError;
pub use signature::Signature;
