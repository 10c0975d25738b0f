//! Per-peer tunnel: signaling, underlay selection, and the runtime loops
//!
//! A tunnel is one framed duplex session with one peer. Establishment runs
//! through the rendezvous service (connect/listen signaling exchange), an
//! optional time-synchronized hole punch, and the underlay handshake for
//! the negotiated link mode. After that two tasks own the connection: the
//! read loop demultiplexes heartbeat, overlay, and relay frames under a
//! rolling read deadline, and the heartbeat loop keeps the peer's deadline
//! fed. `close()` is the single cancellation primitive; it is idempotent
//! and both loops exit within the read deadline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use burrow_crypto::{decrypt_overlay, encrypt_overlay, OverlayKey};
use burrow_net::underlay::quic::{dial_quic, QuicListener};
use burrow_net::underlay::tcp::{TcpAcceptor, TcpUnderlay};
use burrow_net::{punch, LinkMode, NatType, Underlay, UnderlayReader, UnderlayWriter};
use burrow_store::config::defaults::TCP_PROBE_PORT;
use burrow_store::AppConfig;

use crate::network::clock::local_now_ns;
use crate::network::{NetworkCore, OverlayEvent};
use crate::timings::{
    CHECK_ACTIVE_TIMEOUT, READ_MSG_TIMEOUT, TUNNEL_HEARTBEAT_TIME, TUNNEL_IDLE_TIMEOUT,
    UNDERLAY_CONNECT_TIMEOUT,
};
use crate::wire::messages::{
    OverlayConnectReq, OverlayDisconnectReq, PushConnectReq, PushConnectRsp, RelayHeartbeat,
};
use crate::wire::version::supports_server_time;
use crate::wire::{
    self, main_type, p2p, push, SubPacket, HANDSHAKE_HELLO, HANDSHAKE_HELLO_ACK,
    OVERLAY_HEADER_SIZE, RELAY_HEADER_SIZE,
};
use crate::{ProtocolError, Result};

/// Handle to a live tunnel; cheap to clone, shared with the registry.
#[derive(Clone)]
pub struct Tunnel {
    pub(crate) shared: Arc<TunnelShared>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.shared.id)
            .field("peer_node", &self.shared.peer_node)
            .finish()
    }
}

pub(crate) struct TunnelShared {
    pub(crate) id: u64,
    pub(crate) peer_node: String,
    pub(crate) link_mode: LinkMode,
    /// Which side of the signaling exchange we were (orthogonal to the
    /// underlay dial/listen role)
    pub(crate) tunnel_server: bool,
    pub(crate) la: Option<SocketAddr>,
    pub(crate) ra: Option<SocketAddr>,
    pub(crate) punch_ts: u64,
    running: AtomicBool,
    cancel: CancellationToken,
    hb_time: Mutex<Instant>,
    app_keys: Mutex<HashMap<u64, OverlayEntry>>,
    writer: tokio::sync::Mutex<Option<UnderlayWriter>>,
    net: Weak<NetworkCore>,
}

/// One overlay connection's state on this tunnel
struct OverlayEntry {
    app_id: u64,
    key: OverlayKey,
    last_active: Instant,
}

impl Tunnel {
    /// Server-assigned tunnel ID.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Peer node name.
    pub fn peer_node(&self) -> &str {
        &self.shared.peer_node
    }

    /// Negotiated link mode.
    pub fn link_mode(&self) -> LinkMode {
        self.shared.link_mode
    }

    /// Whether this side answered the signaling exchange (the listen role).
    pub fn is_tunnel_server(&self) -> bool {
        self.shared.tunnel_server
    }

    /// Local hole address for punched links.
    pub fn local_hole(&self) -> Option<SocketAddr> {
        self.shared.la
    }

    /// Remote hole address for punched links.
    pub fn remote_hole(&self) -> Option<SocketAddr> {
        self.shared.ra
    }

    /// The shared punch instant this tunnel was established with (0 for
    /// links that never punched).
    pub fn punch_ts(&self) -> u64 {
        self.shared.punch_ts
    }

    /// Whether the runtime loops are (supposed to be) alive.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Liveness: running and a heartbeat was seen within two periods.
    pub fn is_active(&self) -> bool {
        if !self.shared.is_running() {
            return false;
        }
        let hb_time = *self.shared.hb_time.lock().expect("hb mutex poisoned");
        hb_time.elapsed() < TUNNEL_HEARTBEAT_TIME * 2
    }

    /// Synchronous probe: send one heartbeat and poll for the ack.
    pub async fn check_active(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let probe_start = Instant::now();
        if self
            .shared
            .write_frame(main_type::P2P, p2p::TUNNEL_HEARTBEAT, &[])
            .await
            .is_err()
        {
            return false;
        }
        let polls = (CHECK_ACTIVE_TIMEOUT.as_millis() / 100) as u32;
        for _ in 0..polls {
            {
                let hb_time = *self.shared.hb_time.lock().expect("hb mutex poisoned");
                if hb_time > probe_start {
                    info!("{} checkActive ok", self.shared.id);
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("{} checkActive failed", self.shared.id);
        false
    }

    /// Tear the tunnel down: stop both loops, deregister, close the
    /// underlay. Safe to call repeatedly and from any task.
    pub async fn close(&self) {
        self.shared.set_running(false);
        self.shared.cancel.cancel();
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            writer.close().await;
        }
        if let Some(core) = self.shared.net.upgrade() {
            core.remove_tunnel(self.shared.id);
        }
        debug!("{} tunnel closed", self.shared.id);
    }

    /// Announce an overlay connection to the peer and install its key on
    /// both ends.
    pub async fn open_overlay(&self, app_id: u64, overlay_id: u64) -> Result<()> {
        let app_key = match self.shared.net.upgrade() {
            Some(core) => core.get_app_key(app_id),
            None => 0,
        };
        self.shared
            .install_overlay_key(overlay_id, app_id, app_key);
        let req = OverlayConnectReq {
            app_id,
            id: overlay_id,
        };
        self.shared
            .write_frame(
                main_type::P2P,
                p2p::OVERLAY_CONNECT_REQ,
                &serde_json::to_vec(&req)?,
            )
            .await
    }

    /// Tear down one overlay connection on both ends.
    pub async fn close_overlay(&self, overlay_id: u64) -> Result<()> {
        self.shared
            .app_keys
            .lock()
            .expect("app_keys mutex poisoned")
            .remove(&overlay_id);
        let req = OverlayDisconnectReq { id: overlay_id };
        self.shared
            .write_frame(
                main_type::P2P,
                p2p::OVERLAY_DISCONNECT_REQ,
                &serde_json::to_vec(&req)?,
            )
            .await
    }

    /// Tear down every overlay connection owned by `app_id`.
    pub async fn close_overlay_conns(&self, app_id: u64) {
        let overlay_ids: Vec<u64> = {
            let app_keys = self.shared.app_keys.lock().expect("app_keys mutex poisoned");
            app_keys
                .iter()
                .filter(|(_, entry)| entry.app_id == app_id)
                .map(|(id, _)| *id)
                .collect()
        };
        for overlay_id in overlay_ids {
            if let Err(e) = self.close_overlay(overlay_id).await {
                debug!("{} overlay {} close: {}", self.shared.id, overlay_id, e);
            }
        }
    }

    /// Send overlay payload to the peer, encrypting when the overlay has a
    /// non-nil key.
    pub async fn write_overlay(&self, overlay_id: u64, plaintext: &[u8]) -> Result<()> {
        let key = {
            let mut app_keys = self.shared.app_keys.lock().expect("app_keys mutex poisoned");
            app_keys.get_mut(&overlay_id).map(|entry| {
                entry.last_active = Instant::now();
                entry.key.clone()
            })
        };
        let payload = match &key {
            Some(key) => encrypt_overlay(key, plaintext),
            None => plaintext.to_vec(),
        };
        let mut body = Vec::with_capacity(OVERLAY_HEADER_SIZE + payload.len());
        body.extend_from_slice(&overlay_id.to_le_bytes());
        body.extend_from_slice(&payload);
        self.shared
            .write_frame(main_type::P2P, p2p::OVERLAY_DATA, &body)
            .await
    }

    /// Write one frame on the underlay (used by apps for relay traffic).
    pub(crate) async fn write_frame(&self, main: u16, sub: u16, body: &[u8]) -> Result<()> {
        self.shared.write_frame(main, sub, body).await
    }

    /// Write pre-encoded frame bytes unchanged (relay forwarding).
    pub(crate) async fn write_raw(&self, frame_bytes: &[u8]) -> Result<()> {
        self.shared.write_raw(frame_bytes).await
    }
}

impl TunnelShared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    fn touch_heartbeat(&self) {
        *self.hb_time.lock().expect("hb mutex poisoned") = Instant::now();
    }

    fn install_overlay_key(&self, overlay_id: u64, app_id: u64, app_key: u64) {
        let entry = OverlayEntry {
            app_id,
            key: OverlayKey::from_app_key(app_key),
            last_active: Instant::now(),
        };
        self.app_keys
            .lock()
            .expect("app_keys mutex poisoned")
            .insert(overlay_id, entry);
    }

    /// Drop overlay connections nothing has touched within the idle
    /// timeout.
    fn evict_idle_overlays(&self) {
        let mut app_keys = self.app_keys.lock().expect("app_keys mutex poisoned");
        app_keys.retain(|id, entry| {
            let keep = entry.last_active.elapsed() < TUNNEL_IDLE_TIMEOUT;
            if !keep {
                debug!("{} overlay {} evicted after idling", self.id, id);
            }
            keep
        });
    }

    async fn write_frame(&self, main: u16, sub: u16, body: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.write(main, sub, body).await.map_err(Into::into),
            None => Err(ProtocolError::TunnelClosed),
        }
    }

    async fn write_raw(&self, frame_bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.write_raw(frame_bytes).await.map_err(Into::into),
            None => Err(ProtocolError::TunnelClosed),
        }
    }
}

/// Ports prepared before signaling: the local port we will bind and the
/// NAT mapping advertised to the peer.
struct PortPrep {
    cone_local_port: u16,
    cone_nat_port: u16,
}

async fn prepare_ports(core: &Arc<NetworkCore>, link_mode: LinkMode) -> Result<PortPrep> {
    let net = core.network_facts();
    match link_mode {
        LinkMode::Tcp4 | LinkMode::Tcp6 => Ok(PortPrep {
            cone_local_port: net.tcp_port,
            cone_nat_port: net.tcp_port,
        }),
        LinkMode::UdpPunch => {
            // open one fresh cone hole and learn its mapping
            let local_port = 50000 + (rand::random::<u16>() % 15000);
            let (_, nat_port) = burrow_net::nat::probe::nat_test(
                &net.server_host,
                net.udp_port1,
                local_port,
                READ_MSG_TIMEOUT,
            )
            .await?;
            Ok(PortPrep {
                cone_local_port: local_port,
                cone_nat_port: nat_port,
            })
        }
        LinkMode::TcpPunch => {
            // the OS picks the local port; the probe reports its mapping
            let (_, nat_port, local_port) =
                burrow_net::nat::probe::nat_tcp(&net.server_host, TCP_PROBE_PORT, READ_MSG_TIMEOUT)
                    .await?;
            Ok(PortPrep {
                cone_local_port: local_port,
                cone_nat_port: nat_port,
            })
        }
    }
}

/// Client side: run the signaling exchange and establish the underlay.
pub(crate) async fn connect(core: &Arc<NetworkCore>, config: &mut AppConfig) -> Result<Tunnel> {
    let link_mode = config.link_mode.unwrap_or(LinkMode::UdpPunch);
    debug!("start tunnel to {} over {}", config.peer_node, link_mode);

    let id: u64 = rand::random();
    let prep = prepare_ports(core, link_mode).await?;
    let net = core.network_facts();

    let req = PushConnectReq {
        token: if config.peer_token != 0 {
            config.peer_token
        } else {
            net.token
        },
        from: core.node().to_string(),
        from_ip: net.public_ip.clone(),
        cone_nat_port: prep.cone_nat_port,
        nat_type: net.nat_type,
        has_ipv4: net.has_ipv4,
        ipv6: core.config.ipv6(),
        has_upnp_or_natpmp: net.has_upnp_or_natpmp,
        id,
        app_key: 0,
        version: wire::VERSION.to_string(),
        link_mode,
        is_underlay_server: config.is_underlay_server ^ 1,
    };
    core.rendezvous
        .push(&config.peer_node, push::CONNECT_REQ, &req)
        .await?;

    let body = core
        .rendezvous
        .read(
            &config.peer_node,
            main_type::PUSH,
            push::CONNECT_RSP,
            UNDERLAY_CONNECT_TIMEOUT * 3,
        )
        .await?;
    let rsp: PushConnectRsp = serde_json::from_slice(&body)?;
    if rsp.error != 0 {
        return Err(ProtocolError::SignalingRejected(rsp.detail));
    }

    config.peer_nat_type = Some(rsp.nat_type);
    config.peer_has_ipv4 = rsp.has_ipv4;
    config.peer_ipv6 = rsp.ipv6.clone();
    config.peer_has_upnp_or_natpmp = rsp.has_upnp_or_natpmp;
    config.peer_version = rsp.version.clone();
    config.peer_cone_nat_port = rsp.cone_nat_port;
    config.peer_ip = rsp.from_ip.clone();

    start(core, config, id, link_mode, prep, rsp.punch_ts, false)
        .await
        .map_err(|e| match e {
            e @ (ProtocolError::SymmetricPeers | ProtocolError::SignalingRejected(_)) => e,
            other => {
                error!("handshake error: {}", other);
                ProtocolError::Handshake(other.to_string())
            }
        })
}

/// Server side: answer a `PushConnectReq` and establish the underlay.
pub(crate) async fn listen(
    core: &Arc<NetworkCore>,
    config: &mut AppConfig,
    req: &PushConnectReq,
) -> Result<Tunnel> {
    let link_mode = req.link_mode;
    let prep = prepare_ports(core, link_mode).await?;
    let net = core.network_facts();

    let punch_ts = {
        let clock = core.rendezvous.clock();
        let clock = clock.lock().expect("clock mutex poisoned");
        clock.make_punch_ts(local_now_ns())
    };
    let mut rsp = PushConnectRsp {
        error: 0,
        detail: "connect ok".to_string(),
        to: config.peer_node.clone(),
        from: core.node().to_string(),
        nat_type: net.nat_type,
        has_ipv4: net.has_ipv4,
        ipv6: String::new(),
        has_upnp_or_natpmp: net.has_upnp_or_natpmp,
        from_ip: net.public_ip.clone(),
        cone_nat_port: prep.cone_nat_port,
        id: req.id,
        punch_ts,
        version: wire::VERSION.to_string(),
    };
    // only a private-network peer learns our IPv6
    if req.token == net.token {
        rsp.ipv6 = core.config.ipv6();
    }
    core.rendezvous
        .push(&config.peer_node, push::CONNECT_RSP, &rsp)
        .await?;
    debug!("tunnel waiting for {} to connect", config.peer_node);

    start(core, config, req.id, link_mode, prep, punch_ts, true).await
}

/// Common tail of connect/listen: punch when needed, bring the underlay
/// up, spawn the runtime.
async fn start(
    core: &Arc<NetworkCore>,
    config: &mut AppConfig,
    id: u64,
    link_mode: LinkMode,
    prep: PortPrep,
    punch_ts: u64,
    tunnel_server: bool,
) -> Result<Tunnel> {
    let mut punched_socket = None;
    let mut ra = None;
    let la = Some(SocketAddr::new(
        "0.0.0.0".parse().expect("static addr"),
        prep.cone_local_port,
    ));

    if link_mode == LinkMode::UdpPunch {
        let (socket, remote) = punch_handshake(core, config, &prep, punch_ts).await?;
        ra = Some(remote);
        punched_socket = Some(socket);
    }

    let underlay = connect_underlay(core, config, id, link_mode, &prep, punch_ts, punched_socket, ra)
        .await?;

    Ok(spawn_runtime(
        core,
        config,
        id,
        link_mode,
        tunnel_server,
        la,
        ra,
        punch_ts,
        underlay,
    ))
}

/// Sleep until the shared punch instant, then punch the hole.
async fn punch_handshake(
    core: &Arc<NetworkCore>,
    config: &AppConfig,
    prep: &PortPrep,
    punch_ts: u64,
) -> Result<(UdpSocket, SocketAddr)> {
    let peer_ip: std::net::IpAddr = config
        .peer_ip
        .parse()
        .map_err(|_| ProtocolError::Handshake(format!("bad peer IP {}", config.peer_ip)))?;
    let ra_hint = if config.peer_cone_nat_port > 0 {
        Some(SocketAddr::new(peer_ip, config.peer_cone_nat_port))
    } else {
        None
    };

    if supports_server_time(&config.peer_version) || config.peer_version.is_empty() {
        let delay = {
            let clock = core.rendezvous.clock();
            let clock = clock.lock().expect("clock mutex poisoned");
            clock.punch_delay(punch_ts, local_now_ns())
        };
        debug!("sleep {} ms until punch instant", delay.as_millis());
        tokio::time::sleep(delay).await;
    } else {
        debug!(
            "peer version {} predates server-time sync, punching now",
            config.peer_version
        );
    }

    debug!("punching to {}", config.peer_node);
    let socket = UdpSocket::bind(("0.0.0.0", prep.cone_local_port)).await?;
    let net = core.network_facts();
    let peer_nat = config.peer_nat_type.unwrap_or(NatType::Cone);
    let remote = punch::punch(
        &socket,
        net.nat_type,
        peer_nat,
        ra_hint,
        peer_ip,
        UNDERLAY_CONNECT_TIMEOUT,
    )
    .await?;
    debug!("punch to {} ok, hole at {}", config.peer_node, remote);
    Ok((socket, remote))
}

#[allow(clippy::too_many_arguments)]
async fn connect_underlay(
    core: &Arc<NetworkCore>,
    config: &mut AppConfig,
    id: u64,
    link_mode: LinkMode,
    prep: &PortPrep,
    punch_ts: u64,
    punched_socket: Option<UdpSocket>,
    ra: Option<SocketAddr>,
) -> Result<Underlay> {
    let underlay_server = config.is_underlay_server == 1;
    match link_mode {
        LinkMode::UdpPunch => {
            let socket = punched_socket
                .ok_or_else(|| ProtocolError::Handshake("punched socket missing".to_string()))?
                .into_std()?;
            if underlay_server {
                let listener = QuicListener::bind(socket, TUNNEL_IDLE_TIMEOUT)?;
                core.rendezvous
                    .push_raw(&config.peer_node, push::UNDERLAY_CONNECT, b"")
                    .await?;
                let mut underlay = listener
                    .accept(UNDERLAY_CONNECT_TIMEOUT)
                    .await?
                    .into_underlay();
                underlay.set_read_deadline(UNDERLAY_CONNECT_TIMEOUT);
                let (head, body) = underlay.read().await?;
                if head.sub_type != p2p::TUNNEL_HANDSHAKE {
                    return Err(ProtocolError::Handshake(format!(
                        "unexpected first frame {}",
                        head.sub_type
                    )));
                }
                debug!("handshake: {}", String::from_utf8_lossy(&body));
                underlay
                    .write(main_type::P2P, p2p::TUNNEL_HANDSHAKE_ACK, HANDSHAKE_HELLO_ACK)
                    .await?;
                info!("quic connection ok");
                Ok(underlay)
            } else {
                let remote = ra
                    .ok_or_else(|| ProtocolError::Handshake("punched remote missing".to_string()))?;
                await_underlay_notice(core, &config.peer_node).await;
                debug!("quic dial to {}", remote);
                let mut underlay = dial_quic(
                    socket,
                    remote,
                    TUNNEL_IDLE_TIMEOUT,
                    UNDERLAY_CONNECT_TIMEOUT,
                )
                .await?
                .into_underlay();
                let handshake_begin = Instant::now();
                underlay
                    .write(main_type::P2P, p2p::TUNNEL_HANDSHAKE, HANDSHAKE_HELLO)
                    .await?;
                underlay.set_read_deadline(UNDERLAY_CONNECT_TIMEOUT);
                let (head, body) = underlay.read().await?;
                if head.sub_type != p2p::TUNNEL_HANDSHAKE_ACK {
                    return Err(ProtocolError::Handshake(format!(
                        "unexpected handshake ack {}",
                        head.sub_type
                    )));
                }
                debug!("handshake ack: {}", String::from_utf8_lossy(&body));
                info!("quic connection ok, rtt={:?}", handshake_begin.elapsed());
                Ok(underlay)
            }
        }
        LinkMode::Tcp4 | LinkMode::TcpPunch | LinkMode::Tcp6 => {
            connect_underlay_tcp(core, config, id, link_mode, prep, punch_ts).await
        }
    }
}

/// Lease for gateway port mappings opened for a TCP4 listener
const UPNP_LEASE_SECS: u32 = 604_800;

async fn connect_underlay_tcp(
    core: &Arc<NetworkCore>,
    config: &mut AppConfig,
    id: u64,
    link_mode: LinkMode,
    prep: &PortPrep,
    punch_ts: u64,
) -> Result<Underlay> {
    let underlay_server = config.is_underlay_server == 1;

    if underlay_server {
        let local: SocketAddr = match link_mode {
            LinkMode::Tcp6 => format!("[::]:{}", prep.cone_nat_port)
                .parse()
                .map_err(|e| ProtocolError::Handshake(format!("bad listen addr: {}", e)))?,
            _ => format!("0.0.0.0:{}", prep.cone_local_port)
                .parse()
                .map_err(|e| ProtocolError::Handshake(format!("bad listen addr: {}", e)))?,
        };
        // a gateway mapping makes the advertised port reachable from the
        // dialer; best-effort, the dial itself is the test
        if link_mode == LinkMode::Tcp4 && core.network_facts().has_upnp_or_natpmp == 1 {
            match burrow_net::nat::probe::local_ip() {
                Ok(local_ip) => {
                    let internal = SocketAddr::new(local_ip, prep.cone_local_port);
                    match burrow_net::nat::upnp::add_port_mapping(
                        prep.cone_nat_port,
                        internal,
                        "burrow tunnel",
                        UPNP_LEASE_SECS,
                    )
                    .await
                    {
                        Ok(port) => debug!("upnp mapped {} -> {}", port, internal),
                        Err(e) => debug!("upnp mapping failed: {}", e),
                    }
                }
                Err(e) => debug!("no local ip for upnp mapping: {}", e),
            }
        }
        // hold the port before telling the dialer to proceed
        let acceptor = TcpAcceptor::bind(local)?;
        core.rendezvous
            .push_raw(&config.peer_node, push::UNDERLAY_CONNECT, b"")
            .await?;
        let mut underlay = acceptor
            .accept(UNDERLAY_CONNECT_TIMEOUT)
            .await?
            .into_underlay();
        tcp_handshake_server(&mut underlay, id, link_mode).await?;
        info!("{} connection ok", link_mode);
        Ok(underlay)
    } else {
        match link_mode {
            LinkMode::TcpPunch => {
                // simultaneous open needs both sides at the shared instant
                if supports_server_time(&config.peer_version) || config.peer_version.is_empty() {
                    let delay = {
                        let clock = core.rendezvous.clock();
                        let clock = clock.lock().expect("clock mutex poisoned");
                        clock.punch_delay(punch_ts, local_now_ns())
                    };
                    debug!("sleep {} ms until tcp punch instant", delay.as_millis());
                    tokio::time::sleep(delay).await;
                }
            }
            _ => await_underlay_notice(core, &config.peer_node).await,
        }

        let peer: SocketAddr = match link_mode {
            LinkMode::Tcp6 => format!("[{}]:{}", config.peer_ipv6, config.peer_cone_nat_port)
                .parse()
                .map_err(|e| ProtocolError::Handshake(format!("bad peer addr: {}", e)))?,
            _ => format!("{}:{}", config.peer_ip, config.peer_cone_nat_port)
                .parse()
                .map_err(|e| ProtocolError::Handshake(format!("bad peer addr: {}", e)))?,
        };
        let local_port = match link_mode {
            LinkMode::Tcp6 => None,
            _ => Some(prep.cone_local_port),
        };
        debug!("{} dial to {}", link_mode, peer);
        let mut underlay = TcpUnderlay::dial(peer, local_port, UNDERLAY_CONNECT_TIMEOUT)
            .await?
            .into_underlay();

        let handshake_begin = Instant::now();
        let hello: Vec<u8> = match link_mode {
            // IPv4 handshakes identify the tunnel so the listener can match
            LinkMode::Tcp4 | LinkMode::TcpPunch => id.to_le_bytes().to_vec(),
            _ => HANDSHAKE_HELLO.to_vec(),
        };
        underlay
            .write(main_type::P2P, p2p::TUNNEL_HANDSHAKE, &hello)
            .await?;
        underlay.set_read_deadline(UNDERLAY_CONNECT_TIMEOUT);
        let (head, body) = underlay.read().await?;
        if head.sub_type != p2p::TUNNEL_HANDSHAKE_ACK {
            return Err(ProtocolError::Handshake(format!(
                "unexpected handshake ack {}",
                head.sub_type
            )));
        }
        debug!("handshake ack: {}", String::from_utf8_lossy(&body));
        info!(
            "{} connection ok, rtt={:?}",
            link_mode,
            handshake_begin.elapsed()
        );
        Ok(underlay)
    }
}

/// Read and answer the handshake on an accepted TCP connection.
async fn tcp_handshake_server(underlay: &mut Underlay, id: u64, link_mode: LinkMode) -> Result<()> {
    underlay.set_read_deadline(UNDERLAY_CONNECT_TIMEOUT);
    let (head, body) = underlay.read().await?;
    if head.sub_type != p2p::TUNNEL_HANDSHAKE {
        return Err(ProtocolError::Handshake(format!(
            "unexpected first frame {}",
            head.sub_type
        )));
    }
    match link_mode {
        LinkMode::Tcp4 | LinkMode::TcpPunch if body.len() >= 8 => {
            let tid = u64::from_le_bytes(body[..8].try_into().expect("8 bytes"));
            if tid != id {
                warn!("handshake tunnel ID {} does not match {}", tid, id);
            }
        }
        _ => debug!("handshake: {}", String::from_utf8_lossy(&body)),
    }
    underlay
        .write(main_type::P2P, p2p::TUNNEL_HANDSHAKE_ACK, HANDSHAKE_HELLO_ACK)
        .await?;
    Ok(())
}

/// Wait for the listener's go-ahead notice; a missed notice is not fatal,
/// the dial still gets attempted.
async fn await_underlay_notice(core: &Arc<NetworkCore>, peer_node: &str) {
    if let Err(e) = core
        .rendezvous
        .read(
            peer_node,
            main_type::PUSH,
            push::UNDERLAY_CONNECT,
            READ_MSG_TIMEOUT,
        )
        .await
    {
        debug!("no underlay notice from {}: {}", peer_node, e);
    }
}

/// Register the tunnel and spawn its two loops.
#[allow(clippy::too_many_arguments)]
fn spawn_runtime(
    core: &Arc<NetworkCore>,
    config: &AppConfig,
    id: u64,
    link_mode: LinkMode,
    tunnel_server: bool,
    la: Option<SocketAddr>,
    ra: Option<SocketAddr>,
    punch_ts: u64,
    underlay: Underlay,
) -> Tunnel {
    let (reader, writer) = underlay.split();
    let shared = Arc::new(TunnelShared {
        id,
        peer_node: config.peer_node.clone(),
        link_mode,
        tunnel_server,
        la,
        ra,
        punch_ts,
        running: AtomicBool::new(true),
        cancel: CancellationToken::new(),
        hb_time: Mutex::new(Instant::now()),
        app_keys: Mutex::new(HashMap::new()),
        writer: tokio::sync::Mutex::new(Some(writer)),
        net: Arc::downgrade(core),
    });
    let tunnel = Tunnel {
        shared: shared.clone(),
    };
    core.register_tunnel(tunnel.clone());
    tokio::spawn(read_loop(reader, shared.clone()));
    tokio::spawn(heartbeat_loop(shared));
    tunnel
}

/// Demultiplexing loop: one deadline-bounded read per iteration.
async fn read_loop(mut reader: UnderlayReader, shared: Arc<TunnelShared>) {
    debug!("{} tunnel readloop start", shared.id);
    while shared.is_running() {
        reader.set_read_deadline(TUNNEL_IDLE_TIMEOUT);
        let read = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            read = reader.read() => read,
        };
        let (head, body) = match read {
            Ok(frame) => frame,
            Err(e) => {
                if shared.is_running() {
                    error!("{} tunnel read error: {}", shared.id, e);
                }
                break;
            }
        };
        if head.main_type != main_type::P2P {
            warn!("{} unexpected main type {}", shared.id, head.main_type);
            continue;
        }
        dispatch(&shared, head.sub_type, body).await;
    }
    shared.set_running(false);
    shared.cancel.cancel();
    if let Some(mut writer) = shared.writer.lock().await.take() {
        writer.close().await;
    }
    debug!("{} tunnel readloop end", shared.id);
}

async fn dispatch(shared: &Arc<TunnelShared>, sub_type: u16, body: bytes::Bytes) {
    match sub_type {
        p2p::TUNNEL_HEARTBEAT => {
            shared.touch_heartbeat();
            let _ = shared
                .write_frame(main_type::P2P, p2p::TUNNEL_HEARTBEAT_ACK, &[])
                .await;
            debug!("{} read tunnel heartbeat", shared.id);
        }
        p2p::TUNNEL_HEARTBEAT_ACK => {
            shared.touch_heartbeat();
            debug!("{} read tunnel heartbeat ack", shared.id);
        }
        p2p::OVERLAY_DATA => {
            if body.len() < OVERLAY_HEADER_SIZE {
                warn!("{} overlay data shorter than its header", shared.id);
                return;
            }
            let overlay_id = u64::from_le_bytes(body[..8].try_into().expect("8 bytes"));
            let key = {
                let mut app_keys = shared.app_keys.lock().expect("app_keys mutex poisoned");
                app_keys.get_mut(&overlay_id).map(|entry| {
                    entry.last_active = Instant::now();
                    entry.key.clone()
                })
            };
            // a closed overlay always trails some packets; drop quietly
            let Some(key) = key else {
                debug!("{} no overlay connection {}", shared.id, overlay_id);
                return;
            };
            let payload = match decrypt_overlay(&key, &body[OVERLAY_HEADER_SIZE..]) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("{} overlay {} decrypt: {}", shared.id, overlay_id, e);
                    return;
                }
            };
            if let Some(core) = shared.net.upgrade() {
                core.dispatch_overlay(OverlayEvent {
                    tunnel_id: shared.id,
                    overlay_id,
                    payload: payload.into(),
                })
                .await;
            }
        }
        p2p::RELAY_DATA => {
            if body.len() < RELAY_HEADER_SIZE {
                return;
            }
            let tunnel_id = u64::from_le_bytes(body[..8].try_into().expect("8 bytes"));
            debug!(
                "{} relay data to {}, len={}",
                shared.id,
                tunnel_id,
                body.len() - RELAY_HEADER_SIZE
            );
            if let Some(core) = shared.net.upgrade() {
                core.relay(tunnel_id, &body[RELAY_HEADER_SIZE..]).await;
            }
        }
        p2p::RELAY_HEARTBEAT => {
            let req: RelayHeartbeat = match serde_json::from_slice(&body) {
                Ok(req) => req,
                Err(e) => {
                    warn!("{} bad relay heartbeat: {}", shared.id, e);
                    return;
                }
            };
            debug!(
                "{} relay heartbeat rtid:{} appid:{}",
                shared.id, req.relay_tunnel_id, req.app_id
            );
            // answer by retyping the heartbeat body into an ack, wrapped
            // for the hop back
            let ack = SubPacket::retyped(
                p2p::RELAY_HEARTBEAT_ACK,
                SubPacket::raw(p2p::RELAY_HEARTBEAT, body.clone()),
            );
            let inner = match ack.to_frame(main_type::P2P) {
                Ok(frame_bytes) => frame_bytes,
                Err(e) => {
                    warn!("{} relay heartbeat ack encode: {}", shared.id, e);
                    return;
                }
            };
            let mut wrapped = Vec::with_capacity(RELAY_HEADER_SIZE + inner.len());
            wrapped.extend_from_slice(&req.relay_tunnel_id.to_le_bytes());
            wrapped.extend_from_slice(&inner);
            let _ = shared
                .write_frame(main_type::P2P, p2p::RELAY_DATA, &wrapped)
                .await;
        }
        p2p::RELAY_HEARTBEAT_ACK => {
            let req: RelayHeartbeat = match serde_json::from_slice(&body) {
                Ok(req) => req,
                Err(e) => {
                    error!("{} bad relay heartbeat ack: {}", shared.id, e);
                    return;
                }
            };
            debug!("{} relay heartbeat ack appid:{}", shared.id, req.app_id);
            if let Some(core) = shared.net.upgrade() {
                core.update_app_heartbeat(req.app_id);
            }
        }
        p2p::OVERLAY_CONNECT_REQ => {
            let req: OverlayConnectReq = match serde_json::from_slice(&body) {
                Ok(req) => req,
                Err(e) => {
                    warn!("{} bad overlay connect: {}", shared.id, e);
                    return;
                }
            };
            debug!("{} overlay connection {} for app {}", shared.id, req.id, req.app_id);
            let app_key = match shared.net.upgrade() {
                Some(core) => core.get_app_key(req.app_id),
                None => 0,
            };
            shared.install_overlay_key(req.id, req.app_id, app_key);
        }
        p2p::OVERLAY_DISCONNECT_REQ => {
            let req: OverlayDisconnectReq = match serde_json::from_slice(&body) {
                Ok(req) => req,
                Err(e) => {
                    warn!("{} bad overlay disconnect: {}", shared.id, e);
                    return;
                }
            };
            debug!("{} disconnect overlay connection {}", shared.id, req.id);
            shared
                .app_keys
                .lock()
                .expect("app_keys mutex poisoned")
                .remove(&req.id);
        }
        _ => {}
    }
}

/// Heartbeat loop: one frame per period; a write error ends the tunnel.
async fn heartbeat_loop(shared: Arc<TunnelShared>) {
    shared.touch_heartbeat();
    let mut tick = tokio::time::interval_at(
        tokio::time::Instant::now() + TUNNEL_HEARTBEAT_TIME,
        TUNNEL_HEARTBEAT_TIME,
    );
    debug!("{} tunnel heartbeat loop start", shared.id);
    while shared.is_running() {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        if let Err(e) = shared
            .write_frame(main_type::P2P, p2p::TUNNEL_HEARTBEAT, &[])
            .await
        {
            error!("{} write tunnel heartbeat error: {}", shared.id, e);
            shared.set_running(false);
            shared.cancel.cancel();
            break;
        }
        debug!("{} write tunnel heartbeat ok", shared.id);
        shared.evict_idle_overlays();
    }
    debug!("{} tunnel heartbeat loop end", shared.id);
}
