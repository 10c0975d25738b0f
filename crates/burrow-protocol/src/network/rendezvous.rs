//! Rendezvous client: one WebSocket to the coordination server
//!
//! Carries the same 8-byte-header frames as every other transport, one
//! frame per binary WebSocket message. The client logs in on connect, sends
//! a heartbeat every [`NETWORK_HEARTBEAT_TIME`] whose response feeds the
//! clock sync, and routes inbound push messages: connect/relay-tunnel
//! requests go to the network's handler, everything else lands in a mailbox
//! that [`RendezvousClient::read`] consumes. Dropped connections reconnect
//! with exponential backoff and a fresh login.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use burrow_store::config::node_name_to_id;

use super::clock::{local_now_ns, ClockSync};
use super::retry::RetryPolicy;
use crate::timings::NETWORK_HEARTBEAT_TIME;
use crate::wire::messages::{LoginReq, LoginRsp, NetworkHeartbeat};
use crate::wire::{
    self, decode_frame, encode_frame, encode_message, login, main_type, push, FrameHeader,
    PUSH_HEADER_SIZE,
};
use crate::{ProtocolError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// A push message that needs the network's attention (tunnel connect or
/// relay-tunnel queries); everything else goes through the mailbox.
#[derive(Debug)]
pub struct PushEnvelope {
    /// Sender node ID
    pub from_id: u64,
    /// Push sub type
    pub sub_type: u16,
    /// JSON body
    pub body: Bytes,
}

type MailboxKey = (u64, u16, u16);

/// Buffered frames and parked readers, keyed by `(node, main, sub)`
#[derive(Default)]
struct Inbox {
    buffered: HashMap<MailboxKey, VecDeque<Bytes>>,
    waiters: HashMap<MailboxKey, Vec<oneshot::Sender<Bytes>>>,
}

/// Cap per mailbox queue; a peer that nobody reads must not grow memory
const INBOX_QUEUE_LIMIT: usize = 50;

impl Inbox {
    fn deliver(&mut self, key: MailboxKey, body: Bytes) {
        if let Some(waiters) = self.waiters.get_mut(&key) {
            while let Some(waiter) = waiters.pop() {
                match waiter.send(body.clone()) {
                    Ok(()) => return,
                    Err(_) => continue, // reader gave up, try the next
                }
            }
        }
        let queue = self.buffered.entry(key).or_default();
        if queue.len() >= INBOX_QUEUE_LIMIT {
            queue.pop_front();
        }
        queue.push_back(body);
    }

    fn take(&mut self, key: MailboxKey) -> Option<Bytes> {
        self.buffered.get_mut(&key).and_then(|q| q.pop_front())
    }

    fn park(&mut self, key: MailboxKey) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(key).or_default().push(tx);
        rx
    }
}

/// Client half of the rendezvous protocol
pub struct RendezvousClient {
    node: String,
    node_id: u64,
    token: u64,
    url: String,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    inbox: Mutex<Inbox>,
    push_tx: mpsc::Sender<PushEnvelope>,
    clock: Arc<Mutex<ClockSync>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RendezvousClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousClient")
            .field("node", &self.node)
            .field("node_id", &self.node_id)
            .field("url", &self.url)
            .finish()
    }
}

impl RendezvousClient {
    /// Connect, log in, and spawn the reader and heartbeat tasks.
    ///
    /// Returns the client and the stream of push messages the network must
    /// handle. The URL is `wss://host:port/p2p` in production; tests pass a
    /// plain `ws://` endpoint.
    pub async fn connect(
        url: String,
        node: String,
        token: u64,
    ) -> Result<(Arc<Self>, mpsc::Receiver<PushEnvelope>)> {
        let clock = Arc::new(Mutex::new(ClockSync::new()));
        let (sink, source) = establish(&url, &node, token, &clock).await?;

        let (push_tx, push_rx) = mpsc::channel(64);
        let client = Arc::new(Self {
            node_id: node_name_to_id(&node),
            node,
            token,
            url,
            sink: tokio::sync::Mutex::new(Some(sink)),
            inbox: Mutex::new(Inbox::default()),
            push_tx,
            clock,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_loop(client.clone(), source));
        tokio::spawn(heartbeat_loop(client.clone()));
        Ok((client, push_rx))
    }

    /// This node's name.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Shared clock-sync state (updated by the reader task).
    pub fn clock(&self) -> Arc<Mutex<ClockSync>> {
        self.clock.clone()
    }

    /// Send a push message to `to`, JSON-serializing `msg`.
    pub async fn push<T: serde::Serialize>(&self, to: &str, sub_type: u16, msg: &T) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        self.push_raw(to, sub_type, &payload).await
    }

    /// Send a push message with a pre-encoded body.
    pub async fn push_raw(&self, to: &str, sub_type: u16, payload: &[u8]) -> Result<()> {
        let mut body = Vec::with_capacity(PUSH_HEADER_SIZE + payload.len());
        body.extend_from_slice(&self.node_id.to_le_bytes());
        body.extend_from_slice(&node_name_to_id(to).to_le_bytes());
        body.extend_from_slice(payload);
        self.send_frame(encode_frame(main_type::PUSH, sub_type, &body))
            .await
    }

    /// Await a pushed message from `from` with the given type, within
    /// `timeout`.
    pub async fn read(
        &self,
        from: &str,
        main: u16,
        sub: u16,
        timeout: Duration,
    ) -> Result<Bytes> {
        let key = (node_name_to_id(from), main, sub);
        let parked = {
            let mut inbox = self.inbox.lock().expect("inbox mutex poisoned");
            if let Some(body) = inbox.take(key) {
                return Ok(body);
            }
            inbox.park(key)
        };
        match tokio::time::timeout(timeout, parked).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(ProtocolError::Rendezvous("client shut down".to_string())),
            Err(_) => Err(ProtocolError::SignalingTimeout),
        }
    }

    /// Stop the background tasks and drop the socket.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    async fn send_frame(&self, frame_bytes: Vec<u8>) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| ProtocolError::Rendezvous("not connected".to_string()))?;
        sink.send(Message::Binary(frame_bytes))
            .await
            .map_err(|e| ProtocolError::Rendezvous(format!("send failed: {}", e)))
    }

    async fn handle_frame(&self, head: FrameHeader, body: Bytes) {
        match head.main_type {
            main_type::HEARTBEAT => {
                match serde_json::from_slice::<NetworkHeartbeat>(&body) {
                    Ok(hb) => {
                        let mut clock = self.clock.lock().expect("clock mutex poisoned");
                        clock.observe(hb.ts, local_now_ns());
                    }
                    Err(e) => warn!("bad heartbeat body: {}", e),
                }
            }
            main_type::PUSH => {
                if body.len() < PUSH_HEADER_SIZE {
                    warn!("push body shorter than its header: {}", body.len());
                    return;
                }
                let from_id = u64::from_le_bytes(body[..8].try_into().expect("8 bytes"));
                let payload = body.slice(PUSH_HEADER_SIZE..);
                match head.sub_type {
                    push::CONNECT_REQ | push::RELAY_TUNNEL_REQ => {
                        let envelope = PushEnvelope {
                            from_id,
                            sub_type: head.sub_type,
                            body: payload,
                        };
                        if self.push_tx.send(envelope).await.is_err() {
                            debug!("push handler gone, dropping message");
                        }
                    }
                    _ => {
                        let key = (from_id, head.main_type, head.sub_type);
                        self.inbox
                            .lock()
                            .expect("inbox mutex poisoned")
                            .deliver(key, payload);
                    }
                }
            }
            other => debug!("unhandled rendezvous frame main type {}", other),
        }
    }
}

/// Open the WebSocket and perform the login exchange.
async fn establish(
    url: &str,
    node: &str,
    token: u64,
    clock: &Arc<Mutex<ClockSync>>,
) -> Result<(WsSink, WsSource)> {
    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| ProtocolError::Rendezvous(format!("connect {} failed: {}", url, e)))?;
    let (mut sink, mut source) = ws.split();

    let req = LoginReq {
        node: node.to_string(),
        token,
        version: wire::VERSION.to_string(),
    };
    let frame_bytes = encode_message(main_type::LOGIN, login::REQ, &req)?;
    sink.send(Message::Binary(frame_bytes))
        .await
        .map_err(|e| ProtocolError::Rendezvous(format!("login send failed: {}", e)))?;

    let rsp = tokio::time::timeout(crate::timings::READ_MSG_TIMEOUT, async {
        loop {
            let msg = source
                .next()
                .await
                .ok_or_else(|| ProtocolError::Rendezvous("closed during login".to_string()))?
                .map_err(|e| ProtocolError::Rendezvous(format!("login read failed: {}", e)))?;
            let Message::Binary(data) = msg else {
                continue;
            };
            let (head, body) = decode_frame(&data)?;
            if head.main_type == main_type::LOGIN && head.sub_type == login::RSP {
                let rsp: LoginRsp = serde_json::from_slice(&body)?;
                return Ok::<LoginRsp, ProtocolError>(rsp);
            }
        }
    })
    .await
    .map_err(|_| ProtocolError::SignalingTimeout)??;

    if rsp.error != 0 {
        return Err(ProtocolError::SignalingRejected(rsp.detail));
    }
    if rsp.ts != 0 {
        let mut clock = clock.lock().expect("clock mutex poisoned");
        clock.observe(rsp.ts, local_now_ns());
    }
    info!("rendezvous login ok as {}", node);
    Ok((sink, source))
}

/// Reader task: drain frames, reconnect with backoff when the socket dies.
async fn run_loop(client: Arc<RendezvousClient>, mut source: WsSource) {
    let policy = RetryPolicy::default();
    let mut attempt: u32 = 0;
    loop {
        loop {
            let msg = tokio::select! {
                _ = client.cancel.cancelled() => return,
                msg = source.next() => msg,
            };
            let Some(msg) = msg else { break };
            match msg {
                Ok(Message::Binary(data)) => match decode_frame(&data) {
                    Ok((head, body)) => client.handle_frame(head, body).await,
                    Err(e) => warn!("undecodable rendezvous frame: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {} // ping/pong handled by tungstenite
                Err(e) => {
                    warn!("rendezvous read error: {}", e);
                    break;
                }
            }
            attempt = 0;
        }

        // socket died; retire the sink and reconnect
        client.sink.lock().await.take();
        loop {
            if client.cancel.is_cancelled() {
                return;
            }
            let backoff = policy.backoff_for_attempt(attempt);
            info!("rendezvous reconnect in {:?}", backoff);
            tokio::select! {
                _ = client.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt = attempt.saturating_add(1);
            match establish(&client.url, &client.node, client.token, &client.clock).await {
                Ok((sink, new_source)) => {
                    *client.sink.lock().await = Some(sink);
                    source = new_source;
                    info!("rendezvous reconnected");
                    break;
                }
                Err(e) => warn!("rendezvous reconnect failed: {}", e),
            }
        }
    }
}

/// Heartbeat task: keep the server informed and the clock sync fed.
async fn heartbeat_loop(client: Arc<RendezvousClient>) {
    let mut tick = tokio::time::interval_at(
        tokio::time::Instant::now() + NETWORK_HEARTBEAT_TIME,
        NETWORK_HEARTBEAT_TIME,
    );
    loop {
        tokio::select! {
            _ = client.cancel.cancelled() => return,
            _ = tick.tick() => {}
        }
        let hb = NetworkHeartbeat { ts: local_now_ns() };
        let Ok(frame_bytes) = encode_message(main_type::HEARTBEAT, 0, &hb) else {
            continue;
        };
        if let Err(e) = client.send_frame(frame_bytes).await {
            debug!("network heartbeat not sent: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal rendezvous stand-in: accepts one client, answers its login,
    /// then runs `script` with the raw socket.
    async fn spawn_server<F, Fut>(script: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            // login exchange
            let msg = ws.next().await.unwrap().unwrap();
            let Message::Binary(data) = msg else {
                panic!("expected binary login")
            };
            let (head, body) = decode_frame(&data).unwrap();
            assert_eq!(head.main_type, main_type::LOGIN);
            let req: LoginReq = serde_json::from_slice(&body).unwrap();
            assert!(!req.node.is_empty());

            let rsp = LoginRsp {
                error: 0,
                detail: String::new(),
                ts: local_now_ns(),
            };
            let frame_bytes =
                encode_frame(main_type::LOGIN, login::RSP, &serde_json::to_vec(&rsp).unwrap());
            ws.send(Message::Binary(frame_bytes)).await.unwrap();

            script(ws).await;
        });
        format!("ws://{}/p2p", addr)
    }

    fn push_frame(from: &str, to: &str, sub: u16, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&node_name_to_id(from).to_le_bytes());
        body.extend_from_slice(&node_name_to_id(to).to_le_bytes());
        body.extend_from_slice(payload);
        encode_frame(main_type::PUSH, sub, &body)
    }

    #[tokio::test]
    async fn test_connect_and_login() {
        let url = spawn_server(|_ws| async {}).await;
        let (client, _rx) = RendezvousClient::connect(url, "test-node-a".to_string(), 7)
            .await
            .unwrap();
        assert!(client.clock().lock().unwrap().synced());
        client.close().await;
    }

    #[tokio::test]
    async fn test_read_receives_pushed_message() {
        let url = spawn_server(|mut ws| async move {
            let frame_bytes = push_frame(
                "peer-node-b",
                "test-node-a",
                push::CONNECT_RSP,
                br#"{"hello":1}"#,
            );
            ws.send(Message::Binary(frame_bytes)).await.unwrap();
        })
        .await;

        let (client, _rx) = RendezvousClient::connect(url, "test-node-a".to_string(), 7)
            .await
            .unwrap();
        let body = client
            .read(
                "peer-node-b",
                main_type::PUSH,
                push::CONNECT_RSP,
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"hello":1}"#);
        client.close().await;
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let url = spawn_server(|_ws| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;
        let (client, _rx) = RendezvousClient::connect(url, "test-node-a".to_string(), 7)
            .await
            .unwrap();
        let err = client
            .read(
                "peer-node-b",
                main_type::PUSH,
                push::CONNECT_RSP,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::SignalingTimeout));
        client.close().await;
    }

    #[tokio::test]
    async fn test_connect_req_routes_to_handler_channel() {
        let url = spawn_server(|mut ws| async move {
            let frame_bytes = push_frame(
                "peer-node-b",
                "test-node-a",
                push::CONNECT_REQ,
                br#"{"From":"peer-node-b"}"#,
            );
            ws.send(Message::Binary(frame_bytes)).await.unwrap();
        })
        .await;

        let (client, mut rx) = RendezvousClient::connect(url, "test-node-a".to_string(), 7)
            .await
            .unwrap();
        let envelope = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.sub_type, push::CONNECT_REQ);
        assert_eq!(envelope.from_id, node_name_to_id("peer-node-b"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_push_reaches_server() {
        let (seen_tx, seen_rx) = oneshot::channel();
        let url = spawn_server(move |mut ws| async move {
            let msg = ws.next().await.unwrap().unwrap();
            let Message::Binary(data) = msg else {
                panic!("expected binary push")
            };
            let (head, body) = decode_frame(&data).unwrap();
            let _ = seen_tx.send((head, body.to_vec()));
        })
        .await;

        let (client, _rx) = RendezvousClient::connect(url, "test-node-a".to_string(), 7)
            .await
            .unwrap();
        client
            .push_raw("peer-node-b", push::UNDERLAY_CONNECT, b"")
            .await
            .unwrap();

        let (head, body) = seen_rx.await.unwrap();
        assert_eq!(head.main_type, main_type::PUSH);
        assert_eq!(head.sub_type, push::UNDERLAY_CONNECT);
        assert_eq!(
            u64::from_le_bytes(body[..8].try_into().unwrap()),
            node_name_to_id("test-node-a")
        );
        assert_eq!(
            u64::from_le_bytes(body[8..16].try_into().unwrap()),
            node_name_to_id("peer-node-b")
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_login_rejection_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            let rsp = LoginRsp {
                error: 1,
                detail: "bad token".to_string(),
                ts: 0,
            };
            let frame_bytes =
                encode_frame(main_type::LOGIN, login::RSP, &serde_json::to_vec(&rsp).unwrap());
            ws.send(Message::Binary(frame_bytes)).await.unwrap();
        });

        let err = RendezvousClient::connect(
            format!("ws://{}/p2p", addr),
            "test-node-a".to_string(),
            7,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProtocolError::SignalingRejected(detail) if detail == "bad token"));
    }
}
