// Burrow Linux daemon: TUN interface, UDP transport, and timers around one
// shared Edge.

mod config;
mod dns;
mod tun;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use burrow_core::{Action, Edge, EdgeConfig, HANDSHAKE_INTERVAL_SECS, HEARTBEAT_INTERVAL_SECS};
use tun::TunDevice;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("burrow-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    anyhow::ensure!(
        !cfg.password.is_empty(),
        "no overlay password configured (set BURROW_PASSWORD or the config file)"
    );

    let supernode = if dns::is_ip_address(&cfg.supernode_host) {
        std::net::SocketAddr::new(cfg.supernode_host.parse()?, cfg.supernode_port)
    } else {
        dns::resolve(&cfg.supernode_host, cfg.supernode_port)
            .with_context(|| format!("resolving {}", cfg.supernode_host))?
            .into_iter()
            .next()
            .context("supernode name resolved to no addresses")?
    };
    info!("Supernode {} -> {}", cfg.supernode_host, supernode);

    let edge = Arc::new(Edge::new(EdgeConfig {
        password: cfg.password.clone(),
        supernode,
    }));
    let device = Arc::new(TunDevice::create(&cfg.interface).context("creating TUN interface")?);
    info!("TUN interface {} ready", device.name());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, edge, device))
}

async fn run(cfg: config::Config, edge: Arc<Edge>, device: Arc<TunDevice>) -> anyhow::Result<()> {
    let socket = Arc::new(UdpSocket::bind(("0.0.0.0", cfg.listen_port)).await?);
    info!("Listening on UDP {}", cfg.listen_port);

    let (action_tx, action_rx) = tokio::sync::mpsc::unbounded_channel::<Action>();

    for action in edge.connect() {
        let _ = action_tx.send(action);
    }

    // Inbound datagrams.
    {
        let socket = socket.clone();
        let edge = edge.clone();
        let tx = action_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        for action in edge.handle_datagram(now_unix(), from, &buf[..n]) {
                            let _ = tx.send(action);
                        }
                    }
                    Err(e) => {
                        warn!("UDP receive error: {}", e);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        });
    }

    // Handshake timer.
    {
        let edge = edge.clone();
        let tx = action_tx.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(HANDSHAKE_INTERVAL_SECS));
            ticker.tick().await; // the immediate tick; connect() already sent one request
            loop {
                ticker.tick().await;
                for action in edge.handshake_tick(now_unix()) {
                    let _ = tx.send(action);
                }
            }
        });
    }

    // Heartbeat timer (also drives the eviction sweep).
    {
        let edge = edge.clone();
        let tx = action_tx.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for action in edge.heartbeat_tick(now_unix()) {
                    let _ = tx.send(action);
                }
            }
        });
    }

    // Outbound packets from the TUN device. Blocking reads on a plain
    // thread; the engine call itself never blocks.
    {
        let edge = edge.clone();
        let device = device.clone();
        let tx = action_tx.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 65536];
            loop {
                match device.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        for action in edge.write_data(now_unix(), &buf[..n]) {
                            if tx.send(action).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("TUN read error: {}", e);
                        std::thread::sleep(Duration::from_millis(200));
                    }
                }
            }
        });
    }

    let mtu = cfg.mtu;
    tokio::select! {
        res = dispatch(action_rx, socket.clone(), device, edge.clone(), mtu) => res?,
        _ = shutdown_signal() => {}
    }

    // Best-effort goodbye to every live peer before the socket goes away.
    for action in edge.close(now_unix()) {
        if let Action::Send { to, frame } = action {
            let _ = socket.send_to(&frame, to).await;
        }
    }
    info!("Shut down");
    Ok(())
}

/// Apply engine actions: datagrams to the socket, payloads to the TUN
/// device, the leased address to the interface config.
async fn dispatch(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Action>,
    socket: Arc<UdpSocket>,
    device: Arc<TunDevice>,
    edge: Arc<Edge>,
    mtu: u16,
) -> anyhow::Result<()> {
    while let Some(action) = rx.recv().await {
        match action {
            Action::Send { to, frame } => {
                if let Err(e) = socket.send_to(&frame, to).await {
                    debug!("Send to {} failed: {}", to, e);
                }
            }
            Action::Deliver(payload) => {
                if let Err(e) = device.write(&payload) {
                    warn!("TUN write error: {}", e);
                }
            }
            Action::IpAssigned(ip) => {
                let prefix = edge
                    .peers()
                    .cidr()
                    .as_deref()
                    .and_then(|c| c.split_once('/'))
                    .and_then(|(_, p)| p.parse::<u8>().ok())
                    .unwrap_or(24);
                match device.configure(&ip.to_string(), prefix, mtu) {
                    Ok(()) => info!("Overlay address {}/{} on {}", ip, prefix, device.name()),
                    Err(e) => error!("Failed to configure {}: {}", device.name(), e),
                }
            }
            Action::PeerAuthenticated { id, overlay_ip } => match overlay_ip {
                Some(ip) => info!("Peer {} authenticated ({})", id, ip),
                None => info!("Peer {} authenticated", id),
            },
            Action::ConnectionFailed => {
                anyhow::bail!("supernode unreachable after repeated handshake attempts");
            }
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
