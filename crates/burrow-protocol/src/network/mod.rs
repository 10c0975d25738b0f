//! Network: registry of tunnels and apps, rendezvous glue, retry loop
//!
//! The network is the sole owner of tunnels and apps; tunnels hold a weak
//! handle back (relay forwarding and app-heartbeat routing go through it).
//! A push handler task answers inbound connect and relay-tunnel requests,
//! and a scheduler retries failed apps with exponential backoff until the
//! operator disables them.

pub mod clock;
pub mod rendezvous;
pub mod retry;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use burrow_net::{LinkMode, NatType};
use burrow_store::config::Protocol;
use burrow_store::{AppConfig, ConfigStore};

use crate::app::App;
use crate::timings::READ_MSG_TIMEOUT;
use crate::tunnel::{self, Tunnel};
use crate::wire::messages::{PushConnectReq, RelayTunnelReq, RelayTunnelRsp};
use crate::wire::push;
use crate::{ProtocolError, Result};

use rendezvous::{PushEnvelope, RendezvousClient};
use retry::RetryPolicy;

/// How often the scheduler looks for apps that need (re)connecting
const SCHEDULER_TICK: Duration = Duration::from_secs(3);

/// Decrypted overlay payload handed to the local userland
#[derive(Debug, Clone)]
pub struct OverlayEvent {
    /// Tunnel the data arrived on
    pub tunnel_id: u64,
    /// Overlay connection within the tunnel
    pub overlay_id: u64,
    /// Plaintext payload
    pub payload: Bytes,
}

/// Facts about the local node, learned at startup
#[derive(Debug, Clone)]
pub(crate) struct NetworkFacts {
    pub token: u64,
    pub nat_type: NatType,
    pub public_ip: String,
    pub has_ipv4: u8,
    pub has_upnp_or_natpmp: u8,
    pub tcp_port: u16,
    pub udp_port1: u16,
    pub server_host: String,
}

pub(crate) struct NetworkCore {
    pub(crate) config: Arc<ConfigStore>,
    pub(crate) rendezvous: Arc<RendezvousClient>,
    node: String,
    facts: Mutex<NetworkFacts>,
    tunnels: Mutex<HashMap<u64, Tunnel>>,
    apps: Mutex<HashMap<(Protocol, u16), App>>,
    /// `AppID -> app key` for overlay encryption
    app_keys: Mutex<HashMap<u64, u64>>,
    /// apps with a connect attempt in flight
    pending: Mutex<HashSet<(Protocol, u16)>>,
    overlay_tx: mpsc::Sender<OverlayEvent>,
    cancel: CancellationToken,
}

impl NetworkCore {
    pub(crate) fn node(&self) -> &str {
        &self.node
    }

    pub(crate) fn network_facts(&self) -> NetworkFacts {
        self.facts.lock().expect("facts mutex poisoned").clone()
    }

    /// Insert a tunnel, enforcing one active tunnel per `(peer, link
    /// mode)`: an existing duplicate is the loser and gets closed.
    pub(crate) fn register_tunnel(&self, tunnel: Tunnel) {
        let losers: Vec<Tunnel> = {
            let mut tunnels = self.tunnels.lock().expect("tunnels mutex poisoned");
            let losers = tunnels
                .values()
                .filter(|t| {
                    t.peer_node() == tunnel.peer_node() && t.link_mode() == tunnel.link_mode()
                })
                .cloned()
                .collect();
            tunnels.insert(tunnel.id(), tunnel);
            losers
        };
        for loser in losers {
            info!("closing duplicate tunnel {} to {}", loser.id(), loser.peer_node());
            tokio::spawn(async move { loser.close().await });
        }
    }

    pub(crate) fn remove_tunnel(&self, id: u64) {
        self.tunnels
            .lock()
            .expect("tunnels mutex poisoned")
            .remove(&id);
    }

    pub(crate) fn find_tunnel(&self, id: u64) -> Option<Tunnel> {
        self.tunnels
            .lock()
            .expect("tunnels mutex poisoned")
            .get(&id)
            .cloned()
    }

    fn find_active_tunnel_to(&self, peer_node: &str) -> Option<Tunnel> {
        self.tunnels
            .lock()
            .expect("tunnels mutex poisoned")
            .values()
            .find(|t| t.peer_node() == peer_node && t.is_active())
            .cloned()
    }

    /// Re-emit a forwarded frame on the target tunnel, bytes unchanged.
    pub(crate) async fn relay(&self, tunnel_id: u64, frame_bytes: &[u8]) {
        match self.find_tunnel(tunnel_id) {
            Some(target) => {
                if let Err(e) = target.write_raw(frame_bytes).await {
                    warn!("relay to {} failed: {}", tunnel_id, e);
                }
            }
            None => debug!("relay target {} not in registry", tunnel_id),
        }
    }

    /// Refresh relay-mode liveness of the app the ack names.
    pub(crate) fn update_app_heartbeat(&self, app_id: u64) {
        let apps = self.apps.lock().expect("apps mutex poisoned");
        match apps.values().find(|a| a.id() == app_id) {
            Some(app) => app.update_heartbeat(),
            None => debug!("heartbeat ack for unknown app {}", app_id),
        }
    }

    /// Key material for an app's overlays (0 = plaintext).
    pub(crate) fn get_app_key(&self, app_id: u64) -> u64 {
        self.app_keys
            .lock()
            .expect("app keys mutex poisoned")
            .get(&app_id)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) async fn dispatch_overlay(&self, event: OverlayEvent) {
        if self.overlay_tx.send(event).await.is_err() {
            debug!("overlay consumer gone, dropping payload");
        }
    }
}

/// The running node: registry, rendezvous session, background tasks
pub struct Network {
    core: Arc<NetworkCore>,
}

impl Network {
    /// Probe the local network, log in to the rendezvous service, and
    /// start the background tasks.
    pub async fn connect(config: Arc<ConfigStore>) -> Result<(Self, mpsc::Receiver<OverlayEvent>)> {
        let snapshot = config.snapshot();
        let url = format!(
            "wss://{}:{}/p2p",
            snapshot.network.server_host, snapshot.network.server_port
        );
        Self::connect_with_url(config, url).await
    }

    /// [`Network::connect`] with an explicit rendezvous URL (tests use a
    /// plain `ws://` endpoint).
    pub async fn connect_with_url(
        config: Arc<ConfigStore>,
        url: String,
    ) -> Result<(Self, mpsc::Receiver<OverlayEvent>)> {
        let snapshot = config.snapshot();
        let node = snapshot.network.node.clone();

        let facts = probe_network(&config).await;
        info!(
            "network facts: nat={} public_ip={} has_ipv4={} upnp={}",
            facts.nat_type, facts.public_ip, facts.has_ipv4, facts.has_upnp_or_natpmp
        );

        let (rendezvous, push_rx) =
            RendezvousClient::connect(url, node.clone(), snapshot.network.token).await?;

        let (overlay_tx, overlay_rx) = mpsc::channel(128);
        let core = Arc::new(NetworkCore {
            config,
            rendezvous,
            node,
            facts: Mutex::new(facts),
            tunnels: Mutex::new(HashMap::new()),
            apps: Mutex::new(HashMap::new()),
            app_keys: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            overlay_tx,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(push_handler(core.clone(), push_rx));
        tokio::spawn(scheduler(core.clone()));
        Ok((Self { core }, overlay_rx))
    }

    /// This node's name.
    pub fn node(&self) -> &str {
        self.core.node()
    }

    /// Persist an app and let the scheduler bring it up.
    pub fn add_app(&self, app: AppConfig) {
        self.core.config.add_app(app, true);
    }

    /// Establish one tunnel to a peer over a specific link mode.
    pub async fn connect_peer(&self, peer_node: &str, link_mode: LinkMode) -> Result<Tunnel> {
        let mut config = AppConfig {
            peer_node: peer_node.to_string(),
            link_mode: Some(link_mode),
            ..Default::default()
        };
        tunnel::connect(&self.core, &mut config).await
    }

    /// Connect an app right now (the scheduler path, awaitable for direct
    /// control).
    pub async fn connect_app(&self, protocol: Protocol, src_port: u16) -> Result<App> {
        let config = self
            .core
            .config
            .snapshot()
            .apps
            .into_iter()
            .find(|a| a.key() == (protocol, src_port))
            .ok_or_else(|| ProtocolError::SignalingRejected("no such app".to_string()))?;
        connect_app(&self.core, config).await
    }

    /// Stop and remove an app, deleting its config.
    pub async fn delete_app(&self, protocol: Protocol, src_port: u16) {
        let app = self
            .core
            .apps
            .lock()
            .expect("apps mutex poisoned")
            .remove(&(protocol, src_port));
        if let Some(app) = app {
            app.close().await;
        }
        self.core.config.delete_app(protocol, src_port);
    }

    /// Enable or disable an app; disabling closes the running instance.
    pub async fn set_app_enabled(&self, protocol: Protocol, src_port: u16, enabled: bool) {
        self.core
            .config
            .switch_app(protocol, src_port, enabled as u8);
        if !enabled {
            let app = self
                .core
                .apps
                .lock()
                .expect("apps mutex poisoned")
                .remove(&(protocol, src_port));
            if let Some(app) = app {
                app.close().await;
            }
        }
    }

    /// Install key material for an app's overlays.
    pub fn set_app_key(&self, app_id: u64, key: u64) {
        self.core
            .app_keys
            .lock()
            .expect("app keys mutex poisoned")
            .insert(app_id, key);
    }

    /// Look up a running app.
    pub fn app(&self, protocol: Protocol, src_port: u16) -> Option<App> {
        self.core
            .apps
            .lock()
            .expect("apps mutex poisoned")
            .get(&(protocol, src_port))
            .cloned()
    }

    /// Look up a live tunnel by ID.
    pub fn tunnel(&self, id: u64) -> Option<Tunnel> {
        self.core.find_tunnel(id)
    }

    /// IDs of all registered tunnels.
    pub fn tunnel_ids(&self) -> Vec<u64> {
        self.core
            .tunnels
            .lock()
            .expect("tunnels mutex poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Refresh relay-mode liveness for an app (ack path).
    pub fn update_app_heartbeat(&self, app_id: u64) {
        self.core.update_app_heartbeat(app_id);
    }

    /// Stop everything: apps, tunnels, rendezvous, background tasks.
    pub async fn shutdown(&self) {
        self.core.cancel.cancel();
        let apps: Vec<App> = {
            let mut map = self.core.apps.lock().expect("apps mutex poisoned");
            map.drain().map(|(_, app)| app).collect()
        };
        for app in apps {
            app.close().await;
        }
        let tunnels: Vec<Tunnel> = {
            let mut map = self.core.tunnels.lock().expect("tunnels mutex poisoned");
            map.drain().map(|(_, tunnel)| tunnel).collect()
        };
        for tunnel in tunnels {
            tunnel.close().await;
        }
        self.core.rendezvous.close().await;
    }
}

/// Best-effort startup probing; a node without probe reachability still
/// logs in and can accept relay traffic. Facts already recorded in the
/// config (operator override or a previous probe) are taken as-is.
async fn probe_network(config: &Arc<ConfigStore>) -> NetworkFacts {
    let snapshot = config.snapshot();
    let network = &snapshot.network;

    if let Some(nat_type) = network.nat_type {
        return NetworkFacts {
            token: network.token,
            nat_type,
            public_ip: network.public_ip.clone(),
            has_ipv4: network.has_ipv4,
            has_upnp_or_natpmp: network.has_upnp_or_natpmp,
            tcp_port: network.tcp_port,
            udp_port1: network.udp_port1,
            server_host: network.server_host.clone(),
        };
    }

    let local_ip = burrow_net::nat::probe::local_ip().ok();

    let (public_ip, nat_type) = match burrow_net::nat::probe::classify(
        &network.server_host,
        network.udp_port1,
        network.udp_port2,
        0,
        READ_MSG_TIMEOUT,
    )
    .await
    {
        Ok((ip, _, nat_type)) => (ip, nat_type),
        Err(e) => {
            warn!("NAT probe failed, assuming cone: {}", e);
            // the gateway still knows the external address
            let public_ip = match burrow_net::nat::upnp::get_external_ip().await {
                Ok(ip) => ip.to_string(),
                Err(e) => {
                    debug!("no external IP from gateway either: {}", e);
                    String::new()
                }
            };
            (public_ip, NatType::Cone)
        }
    };

    let has_ipv4 = match local_ip {
        Some(local) => burrow_net::nat::probe::has_public_ipv4(&public_ip, local),
        None => 0,
    };
    let has_upnp_or_natpmp = burrow_net::nat::upnp::probe_gateway().await;
    config.set_net_info(nat_type, &public_ip, has_ipv4, has_upnp_or_natpmp);

    NetworkFacts {
        token: network.token,
        nat_type,
        public_ip,
        has_ipv4,
        has_upnp_or_natpmp,
        tcp_port: network.tcp_port,
        udp_port1: network.udp_port1,
        server_host: network.server_host.clone(),
    }
}

/// Answer inbound pushes that need a tunnel-side reaction.
async fn push_handler(core: Arc<NetworkCore>, mut push_rx: mpsc::Receiver<PushEnvelope>) {
    loop {
        let envelope = tokio::select! {
            _ = core.cancel.cancelled() => return,
            envelope = push_rx.recv() => envelope,
        };
        let Some(envelope) = envelope else { return };
        match envelope.sub_type {
            push::CONNECT_REQ => {
                let req: PushConnectReq = match serde_json::from_slice(&envelope.body) {
                    Ok(req) => req,
                    Err(e) => {
                        warn!("bad connect req: {}", e);
                        continue;
                    }
                };
                let core = core.clone();
                tokio::spawn(async move {
                    let peer = req.from.clone();
                    match handle_connect_req(&core, req).await {
                        Ok(_) => {
                            // the peer is evidently online; stop backing off
                            // any apps that target it
                            core.config.retry_apps_for(&peer);
                        }
                        Err(e) => warn!("inbound tunnel failed: {}", e),
                    }
                });
            }
            push::RELAY_TUNNEL_REQ => {
                let req: RelayTunnelReq = match serde_json::from_slice(&envelope.body) {
                    Ok(req) => req,
                    Err(e) => {
                        warn!("bad relay tunnel req: {}", e);
                        continue;
                    }
                };
                let rsp = match core.find_active_tunnel_to(&req.peer_node) {
                    Some(tunnel) => RelayTunnelRsp {
                        tunnel_id: tunnel.id(),
                        error: 0,
                        detail: String::new(),
                    },
                    None => RelayTunnelRsp {
                        tunnel_id: 0,
                        error: 1,
                        detail: format!("no tunnel to {}", req.peer_node),
                    },
                };
                if let Err(e) = core
                    .rendezvous
                    .push(&req.from, push::RELAY_TUNNEL_RSP, &rsp)
                    .await
                {
                    warn!("relay tunnel rsp to {} failed: {}", req.from, e);
                }
            }
            other => debug!("unhandled push sub type {}", other),
        }
    }
}

/// Server side of a tunnel: adopt the requester's facts and listen.
async fn handle_connect_req(core: &Arc<NetworkCore>, req: PushConnectReq) -> Result<Tunnel> {
    debug!("connect req from {} over {}", req.from, req.link_mode);
    let mut config = AppConfig {
        peer_node: req.from.clone(),
        ..Default::default()
    };
    config.from_token = req.token;
    config.peer_token = req.token;
    config.peer_nat_type = Some(req.nat_type);
    config.peer_has_ipv4 = req.has_ipv4;
    config.peer_ipv6 = req.ipv6.clone();
    config.peer_has_upnp_or_natpmp = req.has_upnp_or_natpmp;
    config.peer_ip = req.from_ip.clone();
    config.peer_cone_nat_port = req.cone_nat_port;
    config.peer_version = req.version.clone();
    config.link_mode = Some(req.link_mode);
    config.is_underlay_server = req.is_underlay_server;
    tunnel::listen(core, &mut config, &req).await
}

/// Direct link modes in attempt order
const DIRECT_LADDER: [LinkMode; 3] = [LinkMode::UdpPunch, LinkMode::TcpPunch, LinkMode::Tcp4];

/// Bring one app up: reuse or build the tunnel, resolve the relay hop when
/// configured, register the app.
async fn connect_app(core: &Arc<NetworkCore>, mut config: AppConfig) -> Result<App> {
    let key = config.key();
    {
        let mut pending = core.pending.lock().expect("pending mutex poisoned");
        if !pending.insert(key) {
            return Err(ProtocolError::SignalingRejected(
                "connect already in flight".to_string(),
            ));
        }
    }
    let result = connect_app_inner(core, &mut config).await;
    core.pending.lock().expect("pending mutex poisoned").remove(&key);

    match &result {
        Ok(app) => {
            core.apps
                .lock()
                .expect("apps mutex poisoned")
                .insert(key, app.clone());
        }
        Err(e) => debug!("app {} connect failed: {}", config.id(), e),
    }
    result
}

async fn connect_app_inner(core: &Arc<NetworkCore>, config: &mut AppConfig) -> Result<App> {
    let relay_node = config.relay_node.clone();
    let target = if relay_node.is_empty() {
        config.peer_node.clone()
    } else {
        relay_node.clone()
    };

    let tunnel = match core.find_active_tunnel_to(&target) {
        Some(tunnel) => tunnel,
        None => connect_tunnel_ladder(core, config, &target).await?,
    };

    if relay_node.is_empty() {
        return Ok(App::start(config, tunnel, 0));
    }

    // relay hop: ask the relay for its tunnel to the destination
    let req = RelayTunnelReq {
        from: core.node().to_string(),
        peer_node: config.peer_node.clone(),
    };
    core.rendezvous
        .push(&relay_node, push::RELAY_TUNNEL_REQ, &req)
        .await?;
    let body = core
        .rendezvous
        .read(
            &relay_node,
            crate::wire::main_type::PUSH,
            push::RELAY_TUNNEL_RSP,
            READ_MSG_TIMEOUT,
        )
        .await?;
    let rsp: RelayTunnelRsp = serde_json::from_slice(&body)?;
    if rsp.error != 0 {
        return Err(ProtocolError::SignalingRejected(rsp.detail));
    }
    info!(
        "app {} relays via {} rtid={}",
        config.id(),
        relay_node,
        rsp.tunnel_id
    );
    Ok(App::start(config, tunnel, rsp.tunnel_id))
}

/// Walk the direct link modes until one sticks.
async fn connect_tunnel_ladder(
    core: &Arc<NetworkCore>,
    config: &mut AppConfig,
    target: &str,
) -> Result<Tunnel> {
    let mut tunnel_config = config.clone();
    tunnel_config.peer_node = target.to_string();
    let mut last_err = ProtocolError::SignalingRejected("no link mode attempted".to_string());
    for mode in DIRECT_LADDER {
        tunnel_config.link_mode = Some(mode);
        tunnel_config.is_underlay_server = 0;
        match tunnel::connect(core, &mut tunnel_config).await {
            Ok(tunnel) => {
                config.link_mode = Some(mode);
                return Ok(tunnel);
            }
            Err(e) => {
                debug!("{} over {} failed: {}", target, mode, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Bring up enabled apps, tear down and back off failed ones.
async fn scheduler(core: Arc<NetworkCore>) {
    let policy = RetryPolicy::default();
    let mut tick = tokio::time::interval(SCHEDULER_TICK);
    loop {
        tokio::select! {
            _ = core.cancel.cancelled() => return,
            _ = tick.tick() => {}
        }
        let snapshot = core.config.snapshot();
        for app_config in snapshot.apps {
            if app_config.enabled != 1 || app_config.peer_node.is_empty() {
                continue;
            }
            let key = app_config.key();

            let stale = {
                let apps = core.apps.lock().expect("apps mutex poisoned");
                match apps.get(&key) {
                    Some(app) if app.is_active() => continue,
                    Some(app) => Some(app.clone()),
                    None => None,
                }
            };
            if let Some(app) = stale {
                info!("app {} inactive, reconnecting", app_config.id());
                core.apps.lock().expect("apps mutex poisoned").remove(&key);
                app.close().await;
            }

            if let Some(next) = app_config.next_retry_time {
                if next > Instant::now() {
                    continue;
                }
            }
            if core.pending.lock().expect("pending mutex poisoned").contains(&key) {
                continue;
            }

            let core = core.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                let id = app_config.id();
                match connect_app(&core, app_config).await {
                    Ok(_) => {
                        info!("app {} connected", id);
                        core.config.with_app_mut(key.0, key.1, |a| {
                            a.retry_num = 0;
                            a.next_retry_time = None;
                            a.err_msg.clear();
                        });
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        core.config.with_app_mut(key.0, key.1, |a| {
                            a.err_msg = msg.clone();
                            a.retry_num += 1;
                            a.next_retry_time =
                                Some(Instant::now() + policy.backoff_for_attempt(a.retry_num));
                        });
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_ladder_order() {
        assert_eq!(
            DIRECT_LADDER,
            [LinkMode::UdpPunch, LinkMode::TcpPunch, LinkMode::Tcp4]
        );
    }

}
