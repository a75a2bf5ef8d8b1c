//! Edge orchestrator: owns the per-node protocol state and drives the
//! handshake, heartbeat, routing, and dispatch logic.
//!
//! Host-driven: the owner feeds inbound datagrams, timer ticks, and outbound
//! application packets (with the current unix time), and drains the returned
//! actions. The engine never performs I/O, so several host contexts — the
//! receive path, both timers, the write path — may share one `Edge`
//! concurrently; the registry and the small orchestrator state serialize
//! access internally.

use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::crypto::{self, Algorithm, CipherKind, EcdhKeypair, SessionCipher};
use crate::ip_packet::IpPacket;
use crate::peers::{PeerId, Peers};
use crate::protocol::{
    self, HandshakePayload, Heartbeat, IpLease, PeerQuery, TYPE_CLOSE, TYPE_DATA,
    TYPE_HANDSHAKE, TYPE_HEARTBEAT, TYPE_IP_LEASE, TYPE_PEER_QUERY, TYPE_REJECT,
};

/// Cadence of the handshake resend timer, in seconds.
pub const HANDSHAKE_INTERVAL_SECS: u64 = 10;
/// Cadence of the heartbeat timer, in seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Failed supernode handshake attempts before the owner is told the
/// connection failed. Retries continue on the timer regardless.
const SUPERNODE_FAILURE_LIMIT: u32 = 5;

/// Handshake resends before an ordinary pending peer is dropped. Stale
/// peer-query results must not generate handshake traffic forever.
const MAX_HANDSHAKE_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Shared overlay password; the signing identity is derived from it.
    pub password: String,
    /// Resolved rendezvous address. DNS is the host's job.
    pub supernode: SocketAddr,
}

/// What the host must do with the outcome of an engine call. Datagram sends
/// are fire-and-forget; events are produced at most once each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Hand `frame` to the transport, addressed to `to`.
    Send { to: SocketAddr, frame: Vec<u8> },
    /// Deliver a decrypted application payload to the virtual interface.
    Deliver(Vec<u8>),
    /// The supernode leased us this overlay address.
    IpAssigned(IpAddr),
    /// A peer completed the handshake.
    PeerAuthenticated {
        id: PeerId,
        overlay_ip: Option<IpAddr>,
    },
    /// The supernode could not be reached within the retry budget.
    ConnectionFailed,
}

struct EdgeState {
    virtual_ip: Option<IpAddr>,
    failure_notified: bool,
    closed: bool,
}

pub struct Edge {
    config: EdgeConfig,
    signature: crate::signature::Signature,
    keypair: EcdhKeypair,
    id: PeerId,
    algorithms: Vec<Algorithm>,
    peers: Peers,
    state: Mutex<EdgeState>,
}

impl Edge {
    /// Build an edge, benchmarking the cipher suite for the handshake
    /// advertisement.
    pub fn new(config: EdgeConfig) -> Self {
        Self::with_algorithms(config, crypto::rank_algorithms())
    }

    /// Build an edge with a pre-measured candidate list (tests, multi-node
    /// simulations).
    pub fn with_algorithms(config: EdgeConfig, algorithms: Vec<Algorithm>) -> Self {
        let signature = crate::signature::Signature::from_password(&config.password);
        let peers = Peers::new(config.supernode);
        Self {
            config,
            signature,
            keypair: EcdhKeypair::generate(),
            id: PeerId::random(),
            algorithms,
            peers,
            state: Mutex::new(EdgeState {
                virtual_ip: None,
                failure_notified: false,
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn virtual_ip(&self) -> Option<IpAddr> {
        self.state_lock().virtual_ip
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    /// Queue the supernode for handshaking and send the first request
    /// immediately; the handshake timer takes over from there.
    pub fn connect(&self) -> Vec<Action> {
        if self.state_lock().closed {
            return Vec::new();
        }
        self.peers.add_pending_peer(None, self.config.supernode, true);
        info!("Connecting to supernode at {}", self.config.supernode);
        match self.handshake_frame() {
            Some(frame) => vec![Action::Send { to: self.config.supernode, frame }],
            None => Vec::new(),
        }
    }

    /// Handshake timer body: resend a request to every pending peer, expire
    /// the stale ones, and surface supernode unreachability once the retry
    /// budget is spent.
    pub fn handshake_tick(&self, _now: u64) -> Vec<Action> {
        if self.state_lock().closed {
            return Vec::new();
        }
        let mut actions = Vec::new();
        for pending in self.peers.pending_peers() {
            let key = pending.addr.ip();
            let Some(attempts) = self.peers.record_attempt(&key) else {
                continue;
            };
            if !pending.supernode && attempts > MAX_HANDSHAKE_ATTEMPTS {
                debug!("Dropping pending peer {} after {} attempts", pending.addr, attempts - 1);
                self.peers.remove_pending_peer(&key);
                continue;
            }
            if pending.supernode && attempts > SUPERNODE_FAILURE_LIMIT {
                let mut state = self.state_lock();
                if !state.failure_notified {
                    state.failure_notified = true;
                    warn!("Supernode unreachable after {} handshake attempts", attempts - 1);
                    actions.push(Action::ConnectionFailed);
                }
            }
            if let Some(frame) = self.handshake_frame() {
                actions.push(Action::Send { to: pending.addr, frame });
            }
        }
        actions
    }

    /// Heartbeat timer body: evict silent peers, then ping the live set.
    pub fn heartbeat_tick(&self, now: u64) -> Vec<Action> {
        if self.state_lock().closed {
            return Vec::new();
        }
        let mut actions = Vec::new();
        for peer in self.peers.find_valid_peers(now) {
            match protocol::build_ping(&peer.cipher, self.id, now as u32) {
                Ok(frame) => actions.push(Action::Send { to: peer.nat_addr, frame }),
                Err(e) => warn!("Failed to build ping for {}: {}", peer.id, e),
            }
        }
        actions
    }

    /// Route one outbound application packet. In-subnet destinations go
    /// direct when a peer is known; otherwise the packet is relayed through
    /// the supernode while a fire-and-forget peer query asks for the
    /// destination's NAT endpoint, so a later packet can upgrade to the
    /// direct path without this one being lost.
    pub fn write_data(&self, _now: u64, packet: &[u8]) -> Vec<Action> {
        if self.state_lock().closed {
            return Vec::new();
        }
        let Some(header) = IpPacket::parse(packet) else {
            debug!("Dropping unparseable outbound packet ({} bytes)", packet.len());
            return Vec::new();
        };
        let dest = header.destination;
        let mut actions = Vec::new();

        if self.peers.is_subnet(&dest) {
            if let Some(peer) = self.peers.find_peer_without_default(&dest) {
                match protocol::build_data(&peer.cipher, packet) {
                    Ok(frame) => actions.push(Action::Send { to: peer.nat_addr, frame }),
                    Err(e) => warn!("Failed to seal packet for {}: {}", dest, e),
                }
                return actions;
            }
            let Some(snode) = self.peers.find_default_peer() else {
                debug!("No supernode session, dropping packet for {}", dest);
                return actions;
            };
            match protocol::build_peer_query_request(&snode.cipher, self.id, dest.to_string()) {
                Ok(frame) => actions.push(Action::Send { to: snode.nat_addr, frame }),
                Err(e) => warn!("Failed to build peer query for {}: {}", dest, e),
            }
            match protocol::build_data(&snode.cipher, packet) {
                Ok(frame) => actions.push(Action::Send { to: snode.nat_addr, frame }),
                Err(e) => warn!("Failed to seal relayed packet for {}: {}", dest, e),
            }
            return actions;
        }

        match self.peers.find_default_peer() {
            Some(snode) => match protocol::build_data(&snode.cipher, packet) {
                Ok(frame) => actions.push(Action::Send { to: snode.nat_addr, frame }),
                Err(e) => warn!("Failed to seal relayed packet for {}: {}", dest, e),
            },
            None => debug!("No supernode session, dropping packet for {}", dest),
        }
        actions
    }

    /// Dispatch one inbound datagram. Malformed, spoofed, or unknown input
    /// is dropped and logged; it never affects other peers' state.
    pub fn handle_datagram(&self, now: u64, from: SocketAddr, data: &[u8]) -> Vec<Action> {
        if self.state_lock().closed {
            return Vec::new();
        }
        let Some((&kind, body)) = data.split_first() else {
            return Vec::new();
        };
        match kind {
            TYPE_HANDSHAKE => self.on_handshake(now, from, body),
            TYPE_REJECT => self.on_reject(from),
            TYPE_IP_LEASE => self.on_ip_lease(now, from, body),
            TYPE_HEARTBEAT => self.on_heartbeat(now, from, body),
            TYPE_DATA => self.on_data(now, from, body),
            TYPE_PEER_QUERY => self.on_peer_query(now, from, body),
            TYPE_CLOSE => self.on_close(now, from, body),
            other => {
                warn!("Dropping datagram with unknown type {:#04x} from {}", other, from);
                Vec::new()
            }
        }
    }

    /// Best-effort teardown: notify every live peer, then refuse further
    /// work. Notifications are neither acknowledged nor retried.
    pub fn close(&self, now: u64) -> Vec<Action> {
        {
            let mut state = self.state_lock();
            if state.closed {
                return Vec::new();
            }
            state.closed = true;
        }
        let mut actions = Vec::new();
        for peer in self.peers.find_valid_peers(now) {
            if let Ok(frame) = protocol::build_close(&peer.cipher, self.id) {
                actions.push(Action::Send { to: peer.nat_addr, frame });
            }
        }
        info!("Edge {} closed", self.id);
        actions
    }

    fn on_handshake(&self, now: u64, from: SocketAddr, body: &[u8]) -> Vec<Action> {
        match protocol::parse_handshake(&self.signature, body) {
            Ok(HandshakePayload::Request(req)) => self.on_handshake_request(now, from, req),
            Ok(HandshakePayload::Response(resp)) => self.on_handshake_response(now, from, resp),
            Err(e @ protocol::ProtocolError::SignatureVerifyFailed) => {
                // A verifiable-but-wrong handshake gets a rejection so the
                // sender redoes it from scratch; nothing else changes.
                warn!("Rejecting handshake from {}: {}", from, e);
                vec![Action::Send { to: from, frame: protocol::build_reject() }]
            }
            Err(e) => {
                warn!("Dropping handshake from {}: {}", from, e);
                Vec::new()
            }
        }
    }

    fn on_handshake_request(
        &self,
        now: u64,
        from: SocketAddr,
        req: protocol::HandshakeRequest,
    ) -> Vec<Action> {
        let supported: Vec<CipherKind> = self.algorithms.iter().map(|a| a.kind).collect();
        let Some(kind) = crypto::select_algorithm(&req.algorithms, &supported) else {
            debug!("No common cipher with {}, rejecting", from);
            return vec![Action::Send { to: from, frame: protocol::build_reject() }];
        };
        let cipher = match SessionCipher::derive(&self.keypair, &req.public_key, kind) {
            Ok(c) => c,
            Err(e) => {
                warn!("Key agreement with {} failed: {}", from, e);
                return vec![Action::Send { to: from, frame: protocol::build_reject() }];
            }
        };
        let chosen = req
            .algorithms
            .iter()
            .find(|a| a.kind == kind)
            .copied()
            .unwrap_or(Algorithm { kind, speed: 0.0 });
        let frame = match protocol::build_handshake_response(
            &self.signature,
            self.id,
            self.keypair.public_bytes(),
            chosen,
            self.peers.cidr(),
            self.virtual_ip().map(|ip| ip.to_string()),
        ) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to build handshake response for {}: {}", from, e);
                return Vec::new();
            }
        };
        let pending = self.peers.take_pending(&from.ip());
        let overlay_ip = pending.as_ref().and_then(|p| p.overlay_ip);
        let supernode = from.ip() == self.config.supernode.ip();
        self.peers.create_peer(req.id, overlay_ip, from, cipher, supernode, now);
        info!("Accepted handshake from {} with {}", req.id, kind.name());
        vec![
            Action::Send { to: from, frame },
            Action::PeerAuthenticated { id: req.id, overlay_ip },
        ]
    }

    fn on_handshake_response(
        &self,
        now: u64,
        from: SocketAddr,
        resp: protocol::HandshakeResponse,
    ) -> Vec<Action> {
        let kind = resp.algorithm.kind;
        let cipher = match SessionCipher::derive(&self.keypair, &resp.public_key, kind) {
            Ok(c) => c,
            Err(e) => {
                warn!("Key agreement with {} failed: {}", from, e);
                return Vec::new();
            }
        };
        if let Some(cidr) = &resp.cidr {
            self.peers.set_cidr(cidr);
        }
        let gateway = resp
            .gateway
            .as_deref()
            .and_then(|s| s.parse::<IpAddr>().ok());
        let supernode = from.ip() == self.config.supernode.ip();
        let pending = self.peers.take_pending(&from.ip());
        let overlay_ip = if supernode {
            if let Some(gw) = gateway {
                self.peers.set_gateway(gw);
            }
            gateway
        } else {
            pending.as_ref().and_then(|p| p.overlay_ip)
        };
        self.peers
            .create_peer(resp.id, overlay_ip, from, cipher.clone(), supernode, now);
        info!("Handshake with {} complete, cipher {}", resp.id, kind.name());

        let mut actions = vec![Action::PeerAuthenticated { id: resp.id, overlay_ip }];
        if supernode {
            self.state_lock().failure_notified = false;
            if self.virtual_ip().is_none() {
                match protocol::build_ip_lease_request(&cipher, self.id, None) {
                    Ok(frame) => actions.push(Action::Send { to: from, frame }),
                    Err(e) => warn!("Failed to build IP lease request: {}", e),
                }
            }
        }
        actions
    }

    fn on_reject(&self, from: SocketAddr) -> Vec<Action> {
        // Resends ride on the handshake timer; an immediate reply here would
        // let two mismatched nodes reject each other in a tight loop.
        debug!("Handshake rejected by {}, queueing a fresh attempt", from);
        let overlay = self
            .peers
            .find_peer_without_default(&from.ip())
            .and_then(|p| p.overlay_ip);
        let supernode = from.ip() == self.config.supernode.ip();
        self.peers.add_pending_peer(overlay, from, supernode);
        Vec::new()
    }

    fn on_heartbeat(&self, now: u64, from: SocketAddr, body: &[u8]) -> Vec<Action> {
        let Some(peer) = self.peers.find_peer_without_default(&from.ip()) else {
            debug!("Heartbeat from {} without a session, dropping", from);
            return Vec::new();
        };
        match protocol::parse_heartbeat(&peer.cipher, body) {
            Ok(Heartbeat::Ping { id, ts: _ }) => {
                self.peers.touch(&from.ip(), now);
                debug!("Ping from {}", id);
                match protocol::build_pong(&peer.cipher, self.id, now as u32) {
                    Ok(frame) => vec![Action::Send { to: from, frame }],
                    Err(e) => {
                        warn!("Failed to build pong for {}: {}", id, e);
                        Vec::new()
                    }
                }
            }
            Ok(Heartbeat::Pong { id, ts }) => {
                self.peers.touch(&from.ip(), now);
                debug!("Pong from {} (rtt ~{}s)", id, (now as u32).saturating_sub(ts));
                Vec::new()
            }
            Err(e) => {
                warn!("Dropping heartbeat from {}: {}", from, e);
                Vec::new()
            }
        }
    }

    fn on_ip_lease(&self, now: u64, from: SocketAddr, body: &[u8]) -> Vec<Action> {
        let Some(peer) = self.peers.find_peer_without_default(&from.ip()) else {
            debug!("IP lease from {} without a session, dropping", from);
            return Vec::new();
        };
        match protocol::parse_ip_lease(&peer.cipher, body) {
            Ok(IpLease::Response { ip, .. }) => {
                self.peers.touch(&from.ip(), now);
                let Ok(leased) = ip.parse::<IpAddr>() else {
                    warn!("Unparseable leased address {:?}", ip);
                    return Vec::new();
                };
                self.state_lock().virtual_ip = Some(leased);
                info!("Leased overlay address {}", leased);
                vec![Action::IpAssigned(leased)]
            }
            Ok(IpLease::Request { .. }) => {
                debug!("Ignoring IP lease request addressed to an edge");
                Vec::new()
            }
            Err(e) => {
                warn!("Dropping IP lease from {}: {}", from, e);
                Vec::new()
            }
        }
    }

    fn on_data(&self, now: u64, from: SocketAddr, body: &[u8]) -> Vec<Action> {
        let Some(peer) = self.peers.find_peer_without_default(&from.ip()) else {
            debug!("Data from {} without a session, dropping", from);
            return Vec::new();
        };
        match peer.cipher.decrypt(body) {
            Ok(payload) => {
                self.peers.touch(&from.ip(), now);
                vec![Action::Deliver(payload)]
            }
            Err(e) => {
                warn!("Dropping data from {}: {}", from, e);
                Vec::new()
            }
        }
    }

    fn on_peer_query(&self, now: u64, from: SocketAddr, body: &[u8]) -> Vec<Action> {
        let Some(peer) = self.peers.find_peer_without_default(&from.ip()) else {
            debug!("Peer query from {} without a session, dropping", from);
            return Vec::new();
        };
        match protocol::parse_peer_query(&peer.cipher, body) {
            Ok(PeerQuery::Response { ip, nat_ip, nat_port, .. }) => {
                self.peers.touch(&from.ip(), now);
                let Ok(nat) = nat_ip.parse::<IpAddr>() else {
                    warn!("Peer query response with bad NAT address {:?}", nat_ip);
                    return Vec::new();
                };
                let overlay = ip.parse::<IpAddr>().ok();
                let addr = SocketAddr::new(nat, nat_port);
                debug!("Introduced to {} at {}", ip, addr);
                self.peers.add_pending_peer(overlay, addr, false);
                Vec::new()
            }
            Ok(PeerQuery::Request { .. }) => {
                debug!("Ignoring peer query request addressed to an edge");
                Vec::new()
            }
            Err(e) => {
                warn!("Dropping peer query from {}: {}", from, e);
                Vec::new()
            }
        }
    }

    fn on_close(&self, _now: u64, from: SocketAddr, body: &[u8]) -> Vec<Action> {
        let Some(peer) = self.peers.find_peer_without_default(&from.ip()) else {
            return Vec::new();
        };
        match protocol::parse_close(&peer.cipher, body) {
            Ok(close) => {
                info!("Peer {} closed the session", close.id);
                self.peers.remove_peer(&from.ip());
            }
            Err(e) => warn!("Dropping close from {}: {}", from, e),
        }
        Vec::new()
    }

    fn handshake_frame(&self) -> Option<Vec<u8>> {
        match protocol::build_handshake_request(
            &self.signature,
            self.id,
            self.keypair.public_bytes(),
            &self.algorithms,
        ) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Failed to build handshake request: {}", e);
                None
            }
        }
    }

    fn state_lock(&self) -> std::sync::MutexGuard<'_, EdgeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EcdhKeypair;
    use crate::signature::Signature;

    const SNODE: &str = "203.0.113.1:9527";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn algs() -> Vec<Algorithm> {
        vec![
            Algorithm { kind: CipherKind::ChaCha20Poly1305, speed: 100.0 },
            Algorithm { kind: CipherKind::Aes256Gcm, speed: 50.0 },
            Algorithm { kind: CipherKind::Aes128Gcm, speed: 10.0 },
        ]
    }

    fn edge(password: &str) -> Edge {
        Edge::with_algorithms(
            EdgeConfig { password: password.into(), supernode: addr(SNODE) },
            algs(),
        )
    }

    fn v4_packet(src: &str, dst: &str) -> Vec<u8> {
        let mut pkt = vec![0u8; 28];
        pkt[0] = 0x45;
        let src: std::net::Ipv4Addr = src.parse().unwrap();
        let dst: std::net::Ipv4Addr = dst.parse().unwrap();
        pkt[12..16].copy_from_slice(&src.octets());
        pkt[16..20].copy_from_slice(&dst.octets());
        pkt
    }

    fn sent_frame(actions: &[Action], to: SocketAddr, kind: u8) -> Option<Vec<u8>> {
        actions.iter().find_map(|a| match a {
            Action::Send { to: t, frame } if *t == to && frame.first() == Some(&kind) => {
                Some(frame.clone())
            }
            _ => None,
        })
    }

    /// Scripted rendezvous endpoint: answers handshakes, leases addresses,
    /// and introduces peers, entirely through the public codec.
    struct SupernodeSim {
        addr: SocketAddr,
        id: PeerId,
        signature: Signature,
        keypair: EcdhKeypair,
        cipher: Option<SessionCipher>,
    }

    impl SupernodeSim {
        fn new(password: &str) -> Self {
            Self {
                addr: addr(SNODE),
                id: PeerId::random(),
                signature: Signature::from_password(password),
                keypair: EcdhKeypair::generate(),
                cipher: None,
            }
        }

        fn answer_handshake(&mut self, frame: &[u8], cidr: &str, gateway: &str) -> Vec<u8> {
            assert_eq!(frame[0], TYPE_HANDSHAKE);
            let payload = protocol::parse_handshake(&self.signature, &frame[1..]).unwrap();
            let HandshakePayload::Request(req) = payload else {
                panic!("expected handshake request");
            };
            let kind = crypto::select_algorithm(&req.algorithms, &CipherKind::ALL).unwrap();
            self.cipher =
                Some(SessionCipher::derive(&self.keypair, &req.public_key, kind).unwrap());
            protocol::build_handshake_response(
                &self.signature,
                self.id,
                self.keypair.public_bytes(),
                Algorithm { kind, speed: 0.0 },
                Some(cidr.into()),
                Some(gateway.into()),
            )
            .unwrap()
        }

        fn cipher(&self) -> &SessionCipher {
            self.cipher.as_ref().unwrap()
        }
    }

    /// Drive an edge through the supernode handshake; returns the sim with
    /// an established session.
    fn bootstrap(edge: &Edge, now: u64) -> SupernodeSim {
        let mut snode = SupernodeSim::new("pw");
        let actions = edge.connect();
        let request = sent_frame(&actions, snode.addr, TYPE_HANDSHAKE).unwrap();
        let response = snode.answer_handshake(&request, "10.0.0.0/24", "10.0.0.1");
        edge.handle_datagram(now, snode.addr, &response);
        snode
    }

    #[test]
    fn supernode_bootstrap_leases_address() {
        let edge = edge("pw");
        let mut snode = SupernodeSim::new("pw");

        let actions = edge.connect();
        let request = sent_frame(&actions, snode.addr, TYPE_HANDSHAKE).unwrap();

        let response = snode.answer_handshake(&request, "10.0.0.0/24", "10.0.0.1");
        let actions = edge.handle_datagram(1, snode.addr, &response);
        assert!(actions.contains(&Action::PeerAuthenticated {
            id: snode.id,
            overlay_ip: Some(ip("10.0.0.1")),
        }));

        // The edge asks for an address right after the supernode handshake.
        let lease_req = sent_frame(&actions, snode.addr, TYPE_IP_LEASE).unwrap();
        match protocol::parse_ip_lease(snode.cipher(), &lease_req[1..]).unwrap() {
            IpLease::Request { id, ip: None } => assert_eq!(id, edge.id()),
            other => panic!("unexpected lease body: {:?}", other),
        }

        let lease = protocol::build_ip_lease_response(snode.cipher(), snode.id, "10.0.0.5".into())
            .unwrap();
        let actions = edge.handle_datagram(2, snode.addr, &lease);
        assert_eq!(actions, vec![Action::IpAssigned(ip("10.0.0.5"))]);
        assert_eq!(edge.virtual_ip(), Some(ip("10.0.0.5")));
        assert_eq!(edge.peers().cidr().as_deref(), Some("10.0.0.0/24"));
        assert_eq!(edge.peers().gateway(), Some(ip("10.0.0.1")));
    }

    #[test]
    fn edges_converge_and_exchange_data() {
        let a = edge("pw");
        let b = edge("pw");
        let a_addr = addr("198.51.100.1:7000");
        let b_addr = addr("198.51.100.2:7000");

        // Both sides learned of each other (as a pair of peer-query results
        // would arrange) and share the leased subnet.
        a.peers().add_pending_peer(Some(ip("10.0.0.2")), b_addr, false);
        b.peers().add_pending_peer(Some(ip("10.0.0.1")), a_addr, false);
        a.peers().set_cidr("10.0.0.0/24");
        b.peers().set_cidr("10.0.0.0/24");

        let actions = a.handshake_tick(0);
        let request = sent_frame(&actions, b_addr, TYPE_HANDSHAKE).unwrap();

        let actions = b.handle_datagram(1, a_addr, &request);
        assert!(actions.contains(&Action::PeerAuthenticated {
            id: a.id(),
            overlay_ip: Some(ip("10.0.0.1")),
        }));
        let response = sent_frame(&actions, a_addr, TYPE_HANDSHAKE).unwrap();

        let actions = a.handle_datagram(2, b_addr, &response);
        assert!(actions.contains(&Action::PeerAuthenticated {
            id: b.id(),
            overlay_ip: Some(ip("10.0.0.2")),
        }));

        // Both converged on the fastest advertised cipher.
        let a_peer = a.peers().find_peer_without_default(&ip("10.0.0.2")).unwrap();
        let b_peer = b.peers().find_peer_without_default(&ip("10.0.0.1")).unwrap();
        assert_eq!(a_peer.cipher.kind(), CipherKind::ChaCha20Poly1305);
        assert_eq!(b_peer.cipher.kind(), CipherKind::ChaCha20Poly1305);

        // One application packet, delivered over the direct path.
        let pkt = v4_packet("10.0.0.1", "10.0.0.2");
        let actions = a.write_data(3, &pkt);
        let data = sent_frame(&actions, b_addr, TYPE_DATA).unwrap();
        let actions = b.handle_datagram(4, a_addr, &data);
        assert_eq!(actions, vec![Action::Deliver(pkt)]);
    }

    #[test]
    fn unknown_subnet_destination_relays_and_queries() {
        let edge = edge("pw");
        let snode = bootstrap(&edge, 0);

        let pkt = v4_packet("10.0.0.5", "10.0.0.9");
        let actions = edge.write_data(1, &pkt);

        // Fire-and-forget introduction request plus the relayed packet.
        let query = sent_frame(&actions, snode.addr, TYPE_PEER_QUERY).unwrap();
        match protocol::parse_peer_query(snode.cipher(), &query[1..]).unwrap() {
            PeerQuery::Request { ip, .. } => assert_eq!(ip, "10.0.0.9"),
            other => panic!("unexpected query body: {:?}", other),
        }
        let relayed = sent_frame(&actions, snode.addr, TYPE_DATA).unwrap();
        assert_eq!(snode.cipher().decrypt(&relayed[1..]).unwrap(), pkt);

        // The introduction response queues a pending peer for the timer.
        let intro = protocol::build_peer_query_response(
            snode.cipher(),
            snode.id,
            "10.0.0.9".into(),
            "198.51.100.9".into(),
            41000,
        )
        .unwrap();
        edge.handle_datagram(2, snode.addr, &intro);
        let pending = edge.peers().pending_peers();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].addr, addr("198.51.100.9:41000"));
        assert_eq!(pending[0].overlay_ip, Some(ip("10.0.0.9")));
        let actions = edge.handshake_tick(3);
        assert!(sent_frame(&actions, addr("198.51.100.9:41000"), TYPE_HANDSHAKE).is_some());
    }

    #[test]
    fn outside_subnet_destination_always_relays() {
        let edge = edge("pw");
        let snode = bootstrap(&edge, 0);

        let pkt = v4_packet("10.0.0.5", "192.0.2.33");
        let actions = edge.write_data(1, &pkt);
        assert_eq!(actions.len(), 1, "no peer query for an outside destination");
        let relayed = sent_frame(&actions, snode.addr, TYPE_DATA).unwrap();
        assert_eq!(snode.cipher().decrypt(&relayed[1..]).unwrap(), pkt);
    }

    #[test]
    fn write_without_supernode_session_drops() {
        let edge = edge("pw");
        edge.peers().set_cidr("10.0.0.0/24");
        assert!(edge.write_data(0, &v4_packet("10.0.0.5", "10.0.0.9")).is_empty());
        assert!(edge.write_data(0, &v4_packet("10.0.0.5", "192.0.2.33")).is_empty());
        assert!(edge.write_data(0, b"not an ip packet").is_empty());
    }

    #[test]
    fn reject_queues_handshake_resend() {
        let edge = edge("pw");
        edge.connect();
        let actions = edge.handle_datagram(1, addr(SNODE), &protocol::build_reject());
        assert!(actions.is_empty());
        let actions = edge.handshake_tick(HANDSHAKE_INTERVAL_SECS);
        assert!(sent_frame(&actions, addr(SNODE), TYPE_HANDSHAKE).is_some());
    }

    #[test]
    fn reject_after_established_session_requeues_pending() {
        let edge = edge("pw");
        let snode = bootstrap(&edge, 0);
        assert!(edge.peers().pending_peers().is_empty());
        edge.handle_datagram(1, snode.addr, &protocol::build_reject());
        assert!(edge.peers().pending_peers().iter().any(|p| p.supernode));
    }

    #[test]
    fn handshake_without_common_cipher_is_rejected() {
        let responder = Edge::with_algorithms(
            EdgeConfig { password: "pw".into(), supernode: addr(SNODE) },
            vec![Algorithm { kind: CipherKind::ChaCha20Poly1305, speed: 100.0 }],
        );
        let sig = Signature::from_password("pw");
        let kp = EcdhKeypair::generate();
        let request = protocol::build_handshake_request(
            &sig,
            PeerId::random(),
            kp.public_bytes(),
            &[Algorithm { kind: CipherKind::Aes128Gcm, speed: 10.0 }],
        )
        .unwrap();
        let actions = responder.handle_datagram(0, addr("198.51.100.3:7000"), &request);
        assert_eq!(
            actions,
            vec![Action::Send {
                to: addr("198.51.100.3:7000"),
                frame: protocol::build_reject(),
            }]
        );
    }

    #[test]
    fn wrong_password_handshake_is_rejected() {
        let edge = edge("pw");
        let stranger_sig = Signature::from_password("not-the-password");
        let kp = EcdhKeypair::generate();
        let request = protocol::build_handshake_request(
            &stranger_sig,
            PeerId::random(),
            kp.public_bytes(),
            &algs(),
        )
        .unwrap();
        let from = addr("192.0.2.80:5000");
        let actions = edge.handle_datagram(0, from, &request);
        assert_eq!(
            actions,
            vec![Action::Send { to: from, frame: protocol::build_reject() }]
        );
        assert_eq!(edge.peers().peer_count(), 0, "no session for a bad handshake");
    }

    #[test]
    fn connection_failed_surfaces_once_after_budget() {
        let edge = edge("pw");
        edge.connect();
        let mut failures = 0;
        for tick in 1..=10 {
            let actions = edge.handshake_tick(tick * HANDSHAKE_INTERVAL_SECS);
            failures += actions
                .iter()
                .filter(|a| matches!(a, Action::ConnectionFailed))
                .count();
            // The request keeps going out on every tick regardless.
            assert!(sent_frame(&actions, addr(SNODE), TYPE_HANDSHAKE).is_some());
        }
        assert_eq!(failures, 1);
    }

    #[test]
    fn supernode_pending_never_expires() {
        let edge = edge("pw");
        edge.connect();
        for tick in 1..=(MAX_HANDSHAKE_ATTEMPTS + 10) {
            edge.handshake_tick(tick as u64);
        }
        assert_eq!(edge.peers().pending_peers().len(), 1);
    }

    #[test]
    fn stale_pending_peer_expires() {
        let edge = edge("pw");
        let stale = addr("198.51.100.40:7000");
        edge.peers().add_pending_peer(Some(ip("10.0.0.40")), stale, false);
        for tick in 1..=MAX_HANDSHAKE_ATTEMPTS {
            let actions = edge.handshake_tick(tick as u64);
            assert!(sent_frame(&actions, stale, TYPE_HANDSHAKE).is_some());
        }
        let actions = edge.handshake_tick((MAX_HANDSHAKE_ATTEMPTS + 1) as u64);
        assert!(sent_frame(&actions, stale, TYPE_HANDSHAKE).is_none());
        assert!(edge.peers().pending_peers().is_empty());
    }

    #[test]
    fn heartbeat_pings_and_pong_refreshes_liveness() {
        let edge = edge("pw");
        let snode = bootstrap(&edge, 0);

        let actions = edge.heartbeat_tick(50);
        let ping = sent_frame(&actions, snode.addr, TYPE_HEARTBEAT).unwrap();
        match protocol::parse_heartbeat(snode.cipher(), &ping[1..]).unwrap() {
            Heartbeat::Ping { id, ts } => {
                assert_eq!(id, edge.id());
                assert_eq!(ts, 50);
            }
            other => panic!("unexpected heartbeat: {:?}", other),
        }

        let pong = protocol::build_pong(snode.cipher(), snode.id, 55).unwrap();
        edge.handle_datagram(55, snode.addr, &pong);
        // Refreshed at 55: still live at 110, evicted and requeued at 120.
        assert_eq!(edge.heartbeat_tick(110).len(), 1);
        assert!(edge.heartbeat_tick(120).is_empty());
        assert!(edge.peers().pending_peers().iter().any(|p| p.supernode));
    }

    #[test]
    fn inbound_ping_is_answered() {
        let edge = edge("pw");
        let snode = bootstrap(&edge, 0);
        let ping = protocol::build_ping(snode.cipher(), snode.id, 10).unwrap();
        let actions = edge.handle_datagram(10, snode.addr, &ping);
        let pong = sent_frame(&actions, snode.addr, TYPE_HEARTBEAT).unwrap();
        assert!(matches!(
            protocol::parse_heartbeat(snode.cipher(), &pong[1..]).unwrap(),
            Heartbeat::Pong { .. }
        ));
    }

    #[test]
    fn close_notifies_peers_and_halts_the_engine() {
        let edge = edge("pw");
        let snode = bootstrap(&edge, 0);

        let actions = edge.close(1);
        let notice = sent_frame(&actions, snode.addr, TYPE_CLOSE).unwrap();
        assert_eq!(
            protocol::parse_close(snode.cipher(), &notice[1..]).unwrap().id,
            edge.id()
        );

        assert!(edge.write_data(2, &v4_packet("10.0.0.5", "10.0.0.9")).is_empty());
        assert!(edge.handshake_tick(3).is_empty());
        assert!(edge.heartbeat_tick(4).is_empty());
        assert!(edge.close(5).is_empty(), "second close is a no-op");
    }

    #[test]
    fn peer_close_removes_the_session() {
        let a = edge("pw");
        let b = edge("pw");
        let a_addr = addr("198.51.100.1:7000");
        let b_addr = addr("198.51.100.2:7000");
        a.peers().add_pending_peer(Some(ip("10.0.0.2")), b_addr, false);
        b.peers().add_pending_peer(Some(ip("10.0.0.1")), a_addr, false);

        let actions = a.handshake_tick(0);
        let request = sent_frame(&actions, b_addr, TYPE_HANDSHAKE).unwrap();
        let actions = b.handle_datagram(1, a_addr, &request);
        let response = sent_frame(&actions, a_addr, TYPE_HANDSHAKE).unwrap();
        a.handle_datagram(2, b_addr, &response);

        for action in a.close(3) {
            if let Action::Send { to, frame } = action {
                b.handle_datagram(4, a_addr, &frame);
                assert_eq!(to, b_addr);
            }
        }
        assert!(b.peers().find_peer_without_default(&ip("10.0.0.1")).is_none());
    }

    #[test]
    fn adversarial_input_is_contained() {
        let edge = edge("pw");
        let snode = bootstrap(&edge, 0);
        let stranger = addr("192.0.2.66:1234");

        // Unknown type byte, truncated frames, garbage handshakes, sealed
        // frames from a stranger: all dropped without touching state.
        assert!(edge.handle_datagram(1, stranger, &[0x7B, 1, 2, 3]).is_empty());
        assert!(edge.handle_datagram(1, stranger, &[]).is_empty());
        assert!(edge.handle_datagram(1, stranger, &[TYPE_HANDSHAKE, 0xFF, 0x00]).is_empty());
        assert!(edge.handle_datagram(1, stranger, &[TYPE_DATA, 1, 2, 3]).is_empty());
        let sealed = protocol::build_ping(snode.cipher(), snode.id, 1).unwrap();
        assert!(edge.handle_datagram(1, stranger, &sealed).is_empty());

        // Tampered data from a real peer is dropped too.
        let mut data = protocol::build_data(snode.cipher(), b"payload").unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        assert!(edge.handle_datagram(1, snode.addr, &data).is_empty());

        // The session itself is unharmed.
        let ok = protocol::build_data(snode.cipher(), b"payload").unwrap();
        assert_eq!(
            edge.handle_datagram(2, snode.addr, &ok),
            vec![Action::Deliver(b"payload".to_vec())]
        );
    }
}
