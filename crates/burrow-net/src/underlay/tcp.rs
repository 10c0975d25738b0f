//! TCP underlay: IPv4 with a pinned local port, IPv6, and simultaneous open
//!
//! The IPv4 dialer always binds its deterministic local port with
//! `SO_REUSEADDR` so a later punch attempt reuses the same NAT mapping.
//! TCP-punch uses the exact same dial/listen primitives; only the timing
//! (both sides initiating at the shared punch instant) differs, and that is
//! the tunnel's business.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

use super::{frame, ReaderInner, Underlay, UnderlayReader, UnderlayWriter, WriterInner};
use crate::{NetworkError, Result};

/// A framed TCP connection (any of tcp4 / tcp6 / tcppunch)
pub struct TcpUnderlay {
    stream: TcpStream,
    deadline: Option<Duration>,
}

/// Bound listener for the underlay-server side.
///
/// Binding and accepting are separate so the server can announce its
/// readiness (the rendezvous go-ahead notice) after the port is actually
/// held and before it blocks in accept.
pub struct TcpAcceptor {
    listener: tokio::net::TcpListener,
}

impl TcpAcceptor {
    /// Bind `local_addr` with `SO_REUSEADDR` (punching reuses ports fast).
    pub fn bind(local_addr: SocketAddr) -> Result<Self> {
        let socket = match local_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| NetworkError::Listen(format!("socket create failed: {}", e)))?;
        socket
            .set_reuseaddr(true)
            .map_err(|e| NetworkError::Listen(format!("set reuseaddr failed: {}", e)))?;
        socket
            .bind(local_addr)
            .map_err(|e| NetworkError::Listen(format!("bind {} failed: {}", local_addr, e)))?;
        let listener = socket
            .listen(1)
            .map_err(|e| NetworkError::Listen(format!("listen failed: {}", e)))?;
        Ok(Self { listener })
    }

    /// Accept one peer connection within `timeout`.
    pub async fn accept(self, timeout: Duration) -> Result<TcpUnderlay> {
        let (stream, peer) = tokio::time::timeout(timeout, self.listener.accept())
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::Listen(format!("accept failed: {}", e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| NetworkError::Listen(format!("set nodelay failed: {}", e)))?;
        debug!("tcp accept ok from {}", peer);
        Ok(TcpUnderlay {
            stream,
            deadline: None,
        })
    }
}

impl TcpUnderlay {
    /// Dial `peer`, optionally binding `local_port` first (IPv4 punching
    /// requires the source port that the NAT mapping was opened with).
    pub async fn dial(
        peer: SocketAddr,
        local_port: Option<u16>,
        timeout: Duration,
    ) -> Result<Self> {
        let socket = match peer {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| NetworkError::Dial(format!("socket create failed: {}", e)))?;

        if let Some(port) = local_port {
            socket
                .set_reuseaddr(true)
                .map_err(|e| NetworkError::Dial(format!("set reuseaddr failed: {}", e)))?;
            let bind_addr: SocketAddr = match peer {
                SocketAddr::V4(_) => format!("0.0.0.0:{}", port).parse().unwrap(),
                SocketAddr::V6(_) => format!("[::]:{}", port).parse().unwrap(),
            };
            socket
                .bind(bind_addr)
                .map_err(|e| NetworkError::Dial(format!("bind {} failed: {}", bind_addr, e)))?;
        }

        let stream = tokio::time::timeout(timeout, socket.connect(peer))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::Dial(format!("connect {} failed: {}", peer, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| NetworkError::Dial(format!("set nodelay failed: {}", e)))?;
        debug!("tcp dial ok {} -> {}", stream.local_addr()?, peer);
        Ok(Self {
            stream,
            deadline: None,
        })
    }

    /// Bind on `local_addr` and accept exactly one connection.
    pub async fn listen(local_addr: SocketAddr, timeout: Duration) -> Result<Self> {
        TcpAcceptor::bind(local_addr)?.accept(timeout).await
    }

    /// Local address of the connection.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Remote address of the connection.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    pub(crate) async fn write(&mut self, main_type: u16, sub_type: u16, body: &[u8]) -> Result<()> {
        frame::write_frame(&mut self.stream, main_type, sub_type, body).await
    }

    pub(crate) async fn read(&mut self) -> Result<(frame::FrameHeader, bytes::Bytes)> {
        let fut = frame::read_frame(&mut self.stream);
        match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, fut)
                .await
                .map_err(|_| NetworkError::Timeout)?,
            None => fut.await,
        }
    }

    pub(crate) fn set_read_deadline(&mut self, deadline: Duration) {
        self.deadline = Some(deadline);
    }

    pub(crate) async fn close(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.stream.shutdown().await;
    }

    /// Wrap into the underlay variant.
    pub fn into_underlay(self) -> Underlay {
        Underlay::Tcp(self)
    }

    pub(crate) fn split(self) -> (UnderlayReader, UnderlayWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            UnderlayReader {
                inner: ReaderInner::Tcp(read_half),
                deadline: self.deadline,
            },
            UnderlayWriter {
                inner: WriterInner::Tcp(write_half),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::underlay::frame::{main_type, p2p};

    async fn loopback_pair() -> (TcpUnderlay, TcpUnderlay) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpUnderlay {
                stream,
                deadline: None,
            }
        });
        let client = TcpUnderlay::dial(addr, None, Duration::from_secs(5))
            .await
            .unwrap();
        let server = accept.await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_tcp_frame_roundtrip() {
        let (mut client, mut server) = loopback_pair().await;
        client
            .write(main_type::P2P, p2p::TUNNEL_HANDSHAKE, b"OpenP2P,hello")
            .await
            .unwrap();
        let (head, body) = server.read().await.unwrap();
        assert_eq!(head.sub_type, p2p::TUNNEL_HANDSHAKE);
        assert_eq!(&body[..], b"OpenP2P,hello");
    }

    #[tokio::test]
    async fn test_read_deadline_fires() {
        let (_client, mut server) = loopback_pair().await;
        server.set_read_deadline(Duration::from_millis(50));
        let err = server.read().await.unwrap_err();
        assert!(matches!(err, NetworkError::Timeout));
    }

    #[tokio::test]
    async fn test_split_halves_work_concurrently() {
        let (client, mut server) = loopback_pair().await;
        let (mut reader, mut writer) = client.split();

        writer
            .write(main_type::P2P, p2p::TUNNEL_HEARTBEAT, &[])
            .await
            .unwrap();
        let (head, _) = server.read().await.unwrap();
        assert_eq!(head.sub_type, p2p::TUNNEL_HEARTBEAT);

        server
            .write(main_type::P2P, p2p::TUNNEL_HEARTBEAT_ACK, &[])
            .await
            .unwrap();
        let (head, _) = reader.read().await.unwrap();
        assert_eq!(head.sub_type, p2p::TUNNEL_HEARTBEAT_ACK);
    }

    #[tokio::test]
    async fn test_dial_with_bound_local_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        // pick a free port by binding and dropping
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let local_port = probe.local_addr().unwrap().port();
        drop(probe);

        let client = TcpUnderlay::dial(addr, Some(local_port), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(client.local_addr().unwrap().port(), local_port);
        let _ = accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_times_out_without_peer() {
        let result = TcpUnderlay::listen(
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(NetworkError::Timeout)));
    }
}
