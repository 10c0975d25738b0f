//! NAT probes against the rendezvous server
//!
//! The server runs two UDP echo ports and a TCP echo port. A probe sends an
//! empty request frame and the server answers with the source address it
//! observed, which is the NAT mapping for that socket. Two UDP probes from
//! the same local socket to the two server ports classify the NAT: equal
//! mapped ports mean cone, different ports mean symmetric.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::underlay::frame::{self, main_type, nat_probe};
use crate::{NatType, NetworkError, Result};

/// Server's echo of the observed source address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatProbeRsp {
    /// Public IP the server saw
    #[serde(rename = "IP")]
    pub ip: String,
    /// Public (mapped) port the server saw
    #[serde(rename = "Port")]
    pub port: u16,
}

async fn probe_once(socket: &UdpSocket, server: SocketAddr, timeout: Duration) -> Result<NatProbeRsp> {
    let req = frame::encode_frame(main_type::NAT_PROBE, nat_probe::REQ, b"{}");
    socket.send_to(&req, server).await?;

    let mut buf = vec![0u8; 512];
    let (n, from) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| NetworkError::Timeout)??;
    if from != server {
        return Err(NetworkError::NatProbe(format!(
            "echo from unexpected address {}",
            from
        )));
    }
    let (head, body) = frame::decode_frame(&buf[..n])?;
    if head.main_type != main_type::NAT_PROBE || head.sub_type != nat_probe::RSP {
        return Err(NetworkError::NatProbe(format!(
            "unexpected echo type {}:{}",
            head.main_type, head.sub_type
        )));
    }
    serde_json::from_slice(&body)
        .map_err(|e| NetworkError::NatProbe(format!("bad echo body: {}", e)))
}

/// Probe the NAT mapping for a UDP socket bound to `local_port`.
///
/// Returns the public IP and the mapped port the server observed.
pub async fn nat_test(
    server_host: &str,
    udp_port: u16,
    local_port: u16,
    timeout: Duration,
) -> Result<(String, u16)> {
    let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;
    let server = resolve(server_host, udp_port).await?;
    let rsp = probe_once(&socket, server, timeout).await?;
    debug!(
        "nat_test local {} mapped to {}:{}",
        local_port, rsp.ip, rsp.port
    );
    Ok((rsp.ip, rsp.port))
}

/// Classify the local NAT with two probes from one socket.
///
/// Returns the public IP, the mapped port of the first probe (the hole the
/// caller may go on to use), and the classification.
pub async fn classify(
    server_host: &str,
    udp_port1: u16,
    udp_port2: u16,
    local_port: u16,
    timeout: Duration,
) -> Result<(String, u16, NatType)> {
    let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;
    let first = probe_once(&socket, resolve(server_host, udp_port1).await?, timeout).await?;
    let second = probe_once(&socket, resolve(server_host, udp_port2).await?, timeout).await?;

    let nat_type = if first.port == second.port {
        NatType::Cone
    } else {
        NatType::Symmetric
    };
    debug!(
        "nat classify: {}:{} vs {}:{} -> {}",
        first.ip, first.port, second.ip, second.port, nat_type
    );
    Ok((first.ip, first.port, nat_type))
}

/// Probe the NAT mapping for a fresh TCP connection.
///
/// The OS picks the local port; returns `(public_ip, mapped_port,
/// chosen_local_port)` so TCP punching can rebind the same port later.
pub async fn nat_tcp(
    server_host: &str,
    tcp_port: u16,
    timeout: Duration,
) -> Result<(String, u16, u16)> {
    let server = resolve(server_host, tcp_port).await?;
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(server))
        .await
        .map_err(|_| NetworkError::Timeout)?
        .map_err(|e| NetworkError::NatProbe(format!("probe connect failed: {}", e)))?;
    let local_port = stream.local_addr()?.port();

    frame::write_frame(&mut stream, main_type::NAT_PROBE, nat_probe::REQ, b"{}").await?;
    let (head, body) = tokio::time::timeout(timeout, frame::read_frame(&mut stream))
        .await
        .map_err(|_| NetworkError::Timeout)??;
    if head.sub_type != nat_probe::RSP {
        return Err(NetworkError::NatProbe(format!(
            "unexpected echo type {}:{}",
            head.main_type, head.sub_type
        )));
    }
    let rsp: NatProbeRsp = serde_json::from_slice(&body)
        .map_err(|e| NetworkError::NatProbe(format!("bad echo body: {}", e)))?;
    Ok((rsp.ip, rsp.port, local_port))
}

/// The primary local IP (the one routing toward the public internet).
pub fn local_ip() -> Result<IpAddr> {
    // connecting a UDP socket performs no IO, just selects the route
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}

/// Whether this host owns a public IPv4: the locally bound address equals
/// the publicly observed one.
pub fn has_public_ipv4(public_ip: &str, local: IpAddr) -> u8 {
    match public_ip.parse::<IpAddr>() {
        Ok(public) if public == local => 1,
        _ => 0,
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| NetworkError::NatProbe(format!("no address for {}", host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spawn a local UDP echo that answers like the rendezvous server.
    async fn spawn_udp_echo(mapped_port_offset: u16) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                let Ok((_, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let rsp = NatProbeRsp {
                    ip: from.ip().to_string(),
                    port: from.port() + mapped_port_offset,
                };
                let body = serde_json::to_vec(&rsp).unwrap();
                let reply = frame::encode_frame(main_type::NAT_PROBE, nat_probe::RSP, &body);
                let _ = socket.send_to(&reply, from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_nat_test_reports_mapping() {
        let server = spawn_udp_echo(0).await;
        let (ip, port) = nat_test(
            "127.0.0.1",
            server.port(),
            0,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(ip, "127.0.0.1");
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn test_classify_equal_ports_is_cone() {
        // both echoes report the true source port: loopback acts like no NAT
        let s1 = spawn_udp_echo(0).await;
        let s2 = spawn_udp_echo(0).await;
        assert_eq!(s1.ip(), s2.ip());
        let (_, _, nat_type) = classify(
            "127.0.0.1",
            s1.port(),
            s2.port(),
            0,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(nat_type, NatType::Cone);
    }

    #[tokio::test]
    async fn test_classify_differing_ports_is_symmetric() {
        let s1 = spawn_udp_echo(0).await;
        let s2 = spawn_udp_echo(1).await; // skews the reported mapping
        let (_, _, nat_type) = classify(
            "127.0.0.1",
            s1.port(),
            s2.port(),
            0,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(nat_type, NatType::Symmetric);
    }

    #[tokio::test]
    async fn test_nat_tcp_reports_local_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, from) = listener.accept().await.unwrap();
            let (_, _) = frame::read_frame(&mut stream).await.unwrap();
            let rsp = NatProbeRsp {
                ip: from.ip().to_string(),
                port: from.port(),
            };
            let body = serde_json::to_vec(&rsp).unwrap();
            frame::write_frame(&mut stream, main_type::NAT_PROBE, nat_probe::RSP, &body)
                .await
                .unwrap();
        });

        let (ip, mapped, local) = nat_tcp("127.0.0.1", addr.port(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(ip, "127.0.0.1");
        assert_eq!(mapped, local); // loopback: mapping is the identity
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        // a bound socket that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let result = nat_test(
            "127.0.0.1",
            silent.local_addr().unwrap().port(),
            0,
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(NetworkError::Timeout)));
    }

    #[test]
    fn test_has_public_ipv4() {
        let local: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(has_public_ipv4("203.0.113.7", local), 1);
        assert_eq!(has_public_ipv4("198.51.100.1", local), 0);
        assert_eq!(has_public_ipv4("not-an-ip", local), 0);
    }
}
