//! QUIC underlay over a hole-punched UDP socket
//!
//! Both sides keep the exact UDP socket the puncher opened; rebinding would
//! lose the NAT mapping. The `is_underlay_server` side wraps its socket in a
//! listening endpoint and accepts one connection, the other side dials the
//! punched remote address. One bidirectional stream carries all frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{frame, tls, ReaderInner, Underlay, UnderlayReader, UnderlayWriter, WriterInner};
use crate::{NetworkError, Result};

fn transport_config(idle_timeout: Duration) -> Result<Arc<quinn::TransportConfig>> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(idle_timeout.try_into().map_err(|_| {
        NetworkError::Tls(format!("idle timeout {:?} out of range", idle_timeout))
    })?));
    Ok(Arc::new(transport))
}

/// A framed QUIC connection on the punched socket
pub struct QuicUnderlay {
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    deadline: Option<Duration>,
}

/// Listening endpoint for the `is_underlay_server` side
pub struct QuicListener {
    endpoint: quinn::Endpoint,
}

impl QuicListener {
    /// Wrap the punched UDP socket in a listening QUIC endpoint.
    pub fn bind(socket: std::net::UdpSocket, idle_timeout: Duration) -> Result<Self> {
        let identity = tls::generate_self_signed()?;
        let mut server_config = tls::quinn_server_config(&identity)?;
        server_config.transport_config(transport_config(idle_timeout)?);

        let endpoint = quinn::Endpoint::new(
            quinn::EndpointConfig::default(),
            Some(server_config),
            socket,
            Arc::new(quinn::TokioRuntime),
        )
        .map_err(|e| NetworkError::Listen(format!("quic endpoint bind failed: {}", e)))?;
        debug!("quic listener on {}", endpoint.local_addr()?);
        Ok(Self { endpoint })
    }

    /// Accept one peer connection and its first bidirectional stream.
    ///
    /// The stream only becomes visible once the dialer has written its
    /// handshake frame, so a successful accept implies handshake bytes are
    /// already in flight.
    pub async fn accept(self, timeout: Duration) -> Result<QuicUnderlay> {
        let incoming = tokio::time::timeout(timeout, self.endpoint.accept())
            .await
            .map_err(|_| NetworkError::Timeout)?
            .ok_or_else(|| NetworkError::Listen("endpoint closed before accept".to_string()))?;

        let connection = incoming
            .await
            .map_err(|e| NetworkError::Listen(format!("quic accept failed: {}", e)))?;
        let remote = connection.remote_address();

        let (send, recv) = tokio::time::timeout(timeout, connection.accept_bi())
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::Listen(format!("quic accept_bi failed: {}", e)))?;
        info!("quic connection accepted from {}", remote);

        Ok(QuicUnderlay {
            endpoint: self.endpoint,
            connection,
            send,
            recv,
            deadline: None,
        })
    }

    /// Tear the endpoint down without accepting.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"closed");
    }
}

/// Dial QUIC to the punched remote address, reusing the punched socket.
pub async fn dial_quic(
    socket: std::net::UdpSocket,
    remote: SocketAddr,
    idle_timeout: Duration,
    connect_timeout: Duration,
) -> Result<QuicUnderlay> {
    let mut endpoint = quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        None,
        socket,
        Arc::new(quinn::TokioRuntime),
    )
    .map_err(|e| NetworkError::Dial(format!("quic endpoint bind failed: {}", e)))?;

    let mut client_config = tls::quinn_client_config()?;
    client_config.transport_config(transport_config(idle_timeout)?);
    endpoint.set_default_client_config(client_config);

    let connection = tokio::time::timeout(
        connect_timeout,
        endpoint
            .connect(remote, "localhost")
            .map_err(|e| NetworkError::Dial(format!("quic connect initiation failed: {}", e)))?,
    )
    .await
    .map_err(|_| NetworkError::Timeout)?
    .map_err(|e| NetworkError::Dial(format!("quic connect to {} failed: {}", remote, e)))?;
    info!("quic connection established to {}", remote);

    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| NetworkError::Dial(format!("quic open_bi failed: {}", e)))?;

    Ok(QuicUnderlay {
        endpoint,
        connection,
        send,
        recv,
        deadline: None,
    })
}

impl QuicUnderlay {
    /// Remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub(crate) async fn write(&mut self, main_type: u16, sub_type: u16, body: &[u8]) -> Result<()> {
        frame::write_frame(&mut self.send, main_type, sub_type, body).await
    }

    pub(crate) async fn read(&mut self) -> Result<(frame::FrameHeader, bytes::Bytes)> {
        let fut = frame::read_frame(&mut self.recv);
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
        self.connection.close(0u32.into(), b"closed");
    }

    /// Wrap into the underlay variant.
    pub fn into_underlay(self) -> Underlay {
        Underlay::Quic(self)
    }

    pub(crate) fn split(self) -> (UnderlayReader, UnderlayWriter) {
        (
            UnderlayReader {
                inner: ReaderInner::Quic(self.recv),
                deadline: self.deadline,
            },
            UnderlayWriter {
                inner: WriterInner::Quic {
                    send: self.send,
                    connection: self.connection,
                    _endpoint: self.endpoint,
                },
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::underlay::frame::{main_type, p2p};

    fn loopback_socket() -> std::net::UdpSocket {
        std::net::UdpSocket::bind("127.0.0.1:0").unwrap()
    }

    // NOTE: the dialer must write a frame before the listener's accept_bi
    // resolves; QUIC does not announce a stream until data is sent on it.

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_quic_handshake_roundtrip() {
        let server_socket = loopback_socket();
        let server_addr = server_socket.local_addr().unwrap();
        let listener = QuicListener::bind(server_socket, Duration::from_secs(30)).unwrap();

        let server_handle = tokio::spawn(async move {
            let mut server = listener.accept(Duration::from_secs(5)).await.unwrap();
            let (head, body) = server.read().await.unwrap();
            assert_eq!(head.sub_type, p2p::TUNNEL_HANDSHAKE);
            assert_eq!(&body[..], b"OpenP2P,hello");
            server
                .write(main_type::P2P, p2p::TUNNEL_HANDSHAKE_ACK, b"OpenP2P,hello2")
                .await
                .unwrap();
            server
        });

        let mut client = dial_quic(
            loopback_socket(),
            server_addr,
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        client
            .write(main_type::P2P, p2p::TUNNEL_HANDSHAKE, b"OpenP2P,hello")
            .await
            .unwrap();
        let (head, body) = client.read().await.unwrap();
        assert_eq!(head.sub_type, p2p::TUNNEL_HANDSHAKE_ACK);
        assert_eq!(&body[..], b"OpenP2P,hello2");

        let mut server = server_handle.await.unwrap();
        client.close().await;
        server.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_quic_split_and_large_frame() {
        let server_socket = loopback_socket();
        let server_addr = server_socket.local_addr().unwrap();
        let listener = QuicListener::bind(server_socket, Duration::from_secs(30)).unwrap();

        let server_handle = tokio::spawn(async move {
            let server = listener.accept(Duration::from_secs(5)).await.unwrap();
            let (mut reader, writer) = server.split();
            let (head, body) = reader.read().await.unwrap();
            assert_eq!(head.data_len as usize, 100_000);
            assert_eq!(body[99_999], (99_999 % 256) as u8);
            writer
        });

        let client = dial_quic(
            loopback_socket(),
            server_addr,
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let (_reader, mut writer) = client.split();

        let payload: Vec<u8> = (0..100_000).map(|i| (i % 256) as u8).collect();
        writer
            .write(main_type::P2P, p2p::OVERLAY_DATA, &payload)
            .await
            .unwrap();

        let mut server_writer = server_handle.await.unwrap();
        writer.close().await;
        server_writer.close().await;
    }

    #[tokio::test]
    async fn test_dial_unreachable_times_out() {
        let result = dial_quic(
            loopback_socket(),
            "127.0.0.1:1".parse().unwrap(),
            Duration::from_secs(30),
            Duration::from_millis(300),
        )
        .await;
        assert!(result.is_err());
    }
}
