//! App layer: one forwarding unit riding on a tunnel
//!
//! A direct app's liveness is its tunnel's liveness. A relay app owns the
//! relay tunnel ID of the next hop and runs its own heartbeat across it:
//! every period it wraps a `RelayHeartbeat` in a `RelayData` frame prefixed
//! with the hop's tunnel ID; the far end answers the same way and the
//! network routes the ack back into [`App::update_heartbeat`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use burrow_store::config::Protocol;
use burrow_store::AppConfig;

use crate::timings::{CHECK_ACTIVE_TIMEOUT, TUNNEL_HEARTBEAT_TIME, TUNNEL_IDLE_TIMEOUT};
use crate::tunnel::Tunnel;
use crate::wire::messages::RelayHeartbeat;
use crate::wire::{main_type, p2p, SubPacket, RELAY_HEADER_SIZE};

/// Handle to a running app; cheap to clone, shared with the registry.
#[derive(Clone)]
pub struct App {
    shared: Arc<AppShared>,
}

struct AppShared {
    id: u64,
    key: (Protocol, u16),
    tunnel: Tunnel,
    /// Relay tunnel ID of the next hop; 0 means direct
    rtid: u64,
    relay_node: String,
    hb_time: Mutex<Instant>,
    running: AtomicBool,
    cancel: CancellationToken,
    hb_task: Mutex<Option<JoinHandle<()>>>,
}

impl App {
    /// Wrap a tunnel into an app. `rtid = 0` is a direct app; a non-zero
    /// relay tunnel ID starts the relay heartbeat loop.
    pub fn start(config: &AppConfig, tunnel: Tunnel, rtid: u64) -> Self {
        let app = Self {
            shared: Arc::new(AppShared {
                id: rand::random(),
                key: config.key(),
                tunnel,
                rtid,
                relay_node: config.relay_node.clone(),
                hb_time: Mutex::new(Instant::now()),
                running: AtomicBool::new(true),
                cancel: CancellationToken::new(),
                hb_task: Mutex::new(None),
            }),
        };
        if rtid != 0 {
            let handle = tokio::spawn(relay_heartbeat_loop(app.shared.clone()));
            *app.shared.hb_task.lock().expect("hb task mutex poisoned") = Some(handle);
        }
        app
    }

    /// Instance ID (what `RelayHeartbeat.AppID` carries).
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Registry key `(protocol, src_port)`.
    pub fn key(&self) -> (Protocol, u16) {
        self.shared.key
    }

    /// The tunnel this app rides on.
    pub fn tunnel(&self) -> &Tunnel {
        &self.shared.tunnel
    }

    /// Relay tunnel ID of the next hop, 0 when direct.
    pub fn rtid(&self) -> u64 {
        self.shared.rtid
    }

    /// Relay node name, empty when direct.
    pub fn relay_node(&self) -> &str {
        &self.shared.relay_node
    }

    /// Liveness. Direct mode inherits the tunnel's; relay mode requires a
    /// forwarded ack within the idle timeout.
    pub fn is_active(&self) -> bool {
        if self.shared.rtid == 0 {
            return self.shared.tunnel.is_active();
        }
        let hb_time = *self.shared.hb_time.lock().expect("hb mutex poisoned");
        hb_time.elapsed() < TUNNEL_IDLE_TIMEOUT
    }

    /// Refresh relay-mode liveness (called by the network when the
    /// heartbeat ack comes back).
    pub fn update_heartbeat(&self) {
        *self.shared.hb_time.lock().expect("hb mutex poisoned") = Instant::now();
    }

    /// Time since the last heartbeat refresh.
    pub fn heartbeat_age(&self) -> std::time::Duration {
        self.shared
            .hb_time
            .lock()
            .expect("hb mutex poisoned")
            .elapsed()
    }

    /// Synchronous probe. Direct mode defers to the tunnel; relay mode
    /// sends one heartbeat across the hop and polls for its ack.
    pub async fn check_active(&self) -> bool {
        if self.shared.rtid == 0 {
            return self.shared.tunnel.check_active().await;
        }
        let probe_start = Instant::now();
        if send_relay_heartbeat(&self.shared).await.is_err() {
            return false;
        }
        let polls = (CHECK_ACTIVE_TIMEOUT.as_millis() / 100) as u32;
        for _ in 0..polls {
            {
                let hb_time = *self.shared.hb_time.lock().expect("hb mutex poisoned");
                if hb_time > probe_start {
                    return true;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        false
    }

    /// Stop the heartbeat loop, wait for it to drain, and tear down the
    /// app's overlay connections.
    pub async fn close(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.cancel.cancel();
        let handle = self
            .shared
            .hb_task
            .lock()
            .expect("hb task mutex poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.tunnel.close_overlay_conns(self.shared.id).await;
        debug!("app {} closed", self.shared.id);
    }
}

/// One wrapped heartbeat: the hop prefix plus one inner frame.
async fn send_relay_heartbeat(shared: &AppShared) -> crate::Result<()> {
    let req = RelayHeartbeat {
        relay_tunnel_id: shared.tunnel.id(),
        app_id: shared.id,
    };
    let inner = SubPacket::json(p2p::RELAY_HEARTBEAT, &req)?.to_frame(main_type::P2P)?;
    let mut wrapped = Vec::with_capacity(RELAY_HEADER_SIZE + inner.len());
    wrapped.extend_from_slice(&shared.rtid.to_le_bytes());
    wrapped.extend_from_slice(&inner);
    shared
        .tunnel
        .write_frame(main_type::P2P, p2p::RELAY_DATA, &wrapped)
        .await
}

/// One relay heartbeat per period until the app or its tunnel stops.
async fn relay_heartbeat_loop(shared: Arc<AppShared>) {
    debug!("relay heartbeat to rtid:{} start", shared.rtid);
    while shared.tunnel.is_running() && shared.running.load(Ordering::SeqCst) {
        if let Err(e) = send_relay_heartbeat(&shared).await {
            error!("{} relay heartbeat write error: {}", shared.rtid, e);
            break;
        }
        debug!("{} relay heartbeat ok", shared.rtid);
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(TUNNEL_HEARTBEAT_TIME) => {}
        }
    }
    debug!("relay heartbeat to rtid:{} end", shared.rtid);
}
