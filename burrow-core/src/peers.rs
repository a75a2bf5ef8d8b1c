//! Peer registry: authenticated peers in an arena addressed by stable
//! handles, with overlay-IP and NAT-IP index maps pointing into it, plus the
//! pending (unauthenticated) queue and the learned subnet state.
//!
//! The registry is mutated concurrently by the receive path, both timers,
//! and the application write path, so all state sits behind one mutex and
//! the methods take `&self`.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::SessionCipher;

/// Seconds a peer may stay silent before the eviction sweep removes it.
pub const LIVENESS_WINDOW_SECS: u64 = 60;

/// Opaque node identifier (a v4 UUID on the wire). Equality and hashing are
/// over the raw bytes only; transport addresses never identify a peer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_16")] [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    pub fn random() -> Self {
        PeerId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

pub type PeerHandle = u32;

/// An authenticated peer. Created on handshake completion, refreshed on
/// every authenticated message, destroyed by the eviction sweep or an
/// explicit close.
pub struct Peer {
    pub handle: PeerHandle,
    pub id: PeerId,
    /// Address inside the overlay subnet. `None` until learned (a peer that
    /// handshook with us unsolicited is indexed by NAT IP only).
    pub overlay_ip: Option<IpAddr>,
    /// Observed real source address of the peer's datagrams.
    pub nat_addr: SocketAddr,
    pub supernode: bool,
    pub cipher: SessionCipher,
    pub last_active: u64,
}

/// Immutable view of a peer handed out by the registry; carries a clone of
/// the session cipher so callers can seal frames without holding the lock.
#[derive(Clone)]
pub struct PeerSnapshot {
    pub handle: PeerHandle,
    pub id: PeerId,
    pub overlay_ip: Option<IpAddr>,
    pub nat_addr: SocketAddr,
    pub supernode: bool,
    pub cipher: SessionCipher,
}

/// An address we intend to handshake with. Created at bootstrap (supernode)
/// or from a peer-query response; removed on handshake completion, or after
/// the attempt budget for ordinary peers.
#[derive(Debug, Clone)]
pub struct PendingPeer {
    pub addr: SocketAddr,
    pub overlay_ip: Option<IpAddr>,
    pub supernode: bool,
    pub attempts: u32,
}

struct Registry {
    next_handle: PeerHandle,
    arena: HashMap<PeerHandle, Peer>,
    by_overlay: HashMap<IpAddr, PeerHandle>,
    by_nat: HashMap<IpAddr, PeerHandle>,
    pending: HashMap<IpAddr, PendingPeer>,
    gateway: Option<IpAddr>,
    cidr: Option<String>,
    supernode_addr: SocketAddr,
}

impl Registry {
    fn snapshot(&self, peer: &Peer) -> PeerSnapshot {
        PeerSnapshot {
            handle: peer.handle,
            id: peer.id,
            overlay_ip: peer.overlay_ip,
            nat_addr: peer.nat_addr,
            supernode: peer.supernode,
            cipher: peer.cipher.clone(),
        }
    }

    fn lookup(&self, ip: &IpAddr) -> Option<PeerHandle> {
        self.by_overlay
            .get(ip)
            .or_else(|| self.by_nat.get(ip))
            .copied()
    }

    /// Drop a record and both of its index entries.
    fn unlink(&mut self, handle: PeerHandle) -> Option<Peer> {
        let peer = self.arena.remove(&handle)?;
        if let Some(ip) = peer.overlay_ip {
            if self.by_overlay.get(&ip) == Some(&handle) {
                self.by_overlay.remove(&ip);
            }
        }
        let nat_ip = peer.nat_addr.ip();
        if self.by_nat.get(&nat_ip) == Some(&handle) {
            self.by_nat.remove(&nat_ip);
        }
        Some(peer)
    }
}

pub struct Peers {
    inner: Mutex<Registry>,
}

impl Peers {
    pub fn new(supernode_addr: SocketAddr) -> Self {
        Self {
            inner: Mutex::new(Registry {
                next_handle: 0,
                arena: HashMap::new(),
                by_overlay: HashMap::new(),
                by_nat: HashMap::new(),
                pending: HashMap::new(),
                gateway: None,
                cidr: None,
                supernode_addr,
            }),
        }
    }

    /// Insert a freshly authenticated peer, indexed under both its overlay
    /// IP (when known) and its NAT IP. Any prior record aliased by either
    /// key is replaced.
    pub fn create_peer(
        &self,
        id: PeerId,
        overlay_ip: Option<IpAddr>,
        nat_addr: SocketAddr,
        cipher: SessionCipher,
        supernode: bool,
        now: u64,
    ) -> PeerSnapshot {
        let mut reg = self.lock();
        if let Some(handle) = reg.by_nat.get(&nat_addr.ip()).copied() {
            reg.unlink(handle);
        }
        if let Some(ip) = overlay_ip {
            if let Some(handle) = reg.by_overlay.get(&ip).copied() {
                reg.unlink(handle);
            }
        }
        let handle = reg.next_handle;
        reg.next_handle += 1;
        let peer = Peer {
            handle,
            id,
            overlay_ip,
            nat_addr,
            supernode,
            cipher,
            last_active: now,
        };
        let snap = reg.snapshot(&peer);
        if let Some(ip) = overlay_ip {
            reg.by_overlay.insert(ip, handle);
        }
        reg.by_nat.insert(nat_addr.ip(), handle);
        reg.arena.insert(handle, peer);
        info!("Peer {} up at {} (supernode={})", id, nat_addr, supernode);
        snap
    }

    pub fn add_pending_peer(
        &self,
        overlay_ip: Option<IpAddr>,
        addr: SocketAddr,
        supernode: bool,
    ) {
        let mut reg = self.lock();
        reg.pending.entry(addr.ip()).or_insert(PendingPeer {
            addr,
            overlay_ip,
            supernode,
            attempts: 0,
        });
    }

    pub fn remove_pending_peer(&self, ip: &IpAddr) {
        self.lock().pending.remove(ip);
    }

    /// Remove and return the pending entry for `ip` (handshake completed).
    pub fn take_pending(&self, ip: &IpAddr) -> Option<PendingPeer> {
        self.lock().pending.remove(ip)
    }

    pub fn pending_peers(&self) -> Vec<PendingPeer> {
        self.lock().pending.values().cloned().collect()
    }

    /// Bump the handshake attempt counter for a pending entry; returns the
    /// new count.
    pub fn record_attempt(&self, ip: &IpAddr) -> Option<u32> {
        let mut reg = self.lock();
        let entry = reg.pending.get_mut(ip)?;
        entry.attempts += 1;
        Some(entry.attempts)
    }

    /// Exact lookup by overlay or NAT IP. No fallback to the supernode.
    pub fn find_peer_without_default(&self, ip: &IpAddr) -> Option<PeerSnapshot> {
        let reg = self.lock();
        let handle = reg.lookup(ip)?;
        reg.arena.get(&handle).map(|p| reg.snapshot(p))
    }

    /// The designated supernode peer, used as the relay fallback.
    pub fn find_default_peer(&self) -> Option<PeerSnapshot> {
        let reg = self.lock();
        let handle = reg.by_nat.get(&reg.supernode_addr.ip()).copied()?;
        reg.arena
            .get(&handle)
            .filter(|p| p.supernode)
            .map(|p| reg.snapshot(p))
    }

    /// The current live set. Side effect: peers idle beyond the liveness
    /// window are evicted first — the supernode is requeued as pending so
    /// the handshake timer can re-establish the relay path, ordinary peers
    /// are removed from both indexes.
    pub fn find_valid_peers(&self, now: u64) -> Vec<PeerSnapshot> {
        let mut reg = self.lock();
        let expired: Vec<PeerHandle> = reg
            .arena
            .values()
            .filter(|p| now.saturating_sub(p.last_active) > LIVENESS_WINDOW_SECS)
            .map(|p| p.handle)
            .collect();
        for handle in expired {
            if let Some(peer) = reg.unlink(handle) {
                info!("Peer {} at {} timed out", peer.id, peer.nat_addr);
                if peer.supernode {
                    reg.pending.insert(
                        peer.nat_addr.ip(),
                        PendingPeer {
                            addr: peer.nat_addr,
                            overlay_ip: peer.overlay_ip,
                            supernode: true,
                            attempts: 0,
                        },
                    );
                }
            }
        }
        reg.arena.values().map(|p| reg.snapshot(p)).collect()
    }

    /// Remove a peer from both indexes and the pending queue. A no-op when
    /// the record is the supernode, so the relay path cannot be lost to a
    /// stray close.
    pub fn remove_peer(&self, ip: &IpAddr) {
        let mut reg = self.lock();
        if let Some(handle) = reg.lookup(ip) {
            if reg.arena.get(&handle).is_some_and(|p| p.supernode) {
                debug!("Ignoring removal of supernode peer");
                return;
            }
            reg.unlink(handle);
        }
        reg.pending.remove(ip);
    }

    /// Refresh the liveness timestamp of the peer whose NAT IP is `ip`.
    pub fn touch(&self, ip: &IpAddr, now: u64) -> bool {
        let mut reg = self.lock();
        let Some(handle) = reg.lookup(ip) else {
            return false;
        };
        match reg.arena.get_mut(&handle) {
            Some(peer) => {
                peer.last_active = now;
                true
            }
            None => false,
        }
    }

    /// Bitmask test of `ip` against the learned CIDR. False when no CIDR has
    /// been learned, the CIDR string is malformed, or the prefix length is
    /// out of range.
    pub fn is_subnet(&self, ip: &IpAddr) -> bool {
        let reg = self.lock();
        let Some(cidr) = reg.cidr.as_deref() else {
            return false;
        };
        let IpAddr::V4(ip) = ip else {
            return false;
        };
        let Some((network, prefix)) = cidr.split_once('/') else {
            return false;
        };
        let Ok(network) = network.parse::<Ipv4Addr>() else {
            return false;
        };
        let Ok(prefix) = prefix.parse::<u32>() else {
            return false;
        };
        if prefix > 32 {
            return false;
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        u32::from(network) & mask == u32::from(*ip) & mask
    }

    pub fn set_cidr(&self, cidr: &str) {
        self.lock().cidr = Some(cidr.to_string());
    }

    pub fn cidr(&self) -> Option<String> {
        self.lock().cidr.clone()
    }

    pub fn set_gateway(&self, gateway: IpAddr) {
        self.lock().gateway = Some(gateway);
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        self.lock().gateway
    }

    pub fn peer_count(&self) -> usize {
        self.lock().arena.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
