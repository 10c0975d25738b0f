//! Time-synchronized UDP hole punching
//!
//! The tunnel sleeps both peers until the shared punch instant, then calls
//! [`punch`] with the NAT classification of both ends. Cone×cone has both
//! sides dialing the other's advertised mapping; cone×symmetric has the cone
//! side listening on its own hole and learning the symmetric peer's fresh
//! mapping from the first datagram that arrives; symmetric×symmetric is
//! refused. Punch datagrams are ordinary frames so a stray packet from
//! anything else is recognizably junk.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::debug;

use crate::underlay::frame::{self, main_type, p2p};
use crate::{NatType, NetworkError, Result};

/// Interval between hello datagrams while dialing
const HELLO_INTERVAL: Duration = Duration::from_millis(100);

/// Which side initiates once the punch instant arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchStrategy {
    /// Both peers dial the other's cone mapping
    ConeToCone,
    /// Local cone listens on its hole, symmetric peer dials
    ConeToSymmetric,
    /// Local symmetric dials the peer's cone mapping
    SymmetricToCone,
}

/// Pick the strategy for a NAT pairing, refusing symmetric×symmetric.
pub fn select_strategy(local: NatType, peer: NatType) -> Result<PunchStrategy> {
    match (local, peer) {
        (NatType::Cone, NatType::Cone) => Ok(PunchStrategy::ConeToCone),
        (NatType::Cone, NatType::Symmetric) => Ok(PunchStrategy::ConeToSymmetric),
        (NatType::Symmetric, NatType::Cone) => Ok(PunchStrategy::SymmetricToCone),
        (NatType::Symmetric, NatType::Symmetric) => Err(NetworkError::SymmetricSymmetric),
    }
}

/// Punch through to the peer on an already-bound socket.
///
/// `peer_cone_addr` is the peer's advertised mapping (required unless the
/// peer is symmetric); `peer_ip` filters inbound datagrams when listening.
/// Returns the remote hole address the tunnel should talk to.
pub async fn punch(
    socket: &UdpSocket,
    local_nat: NatType,
    peer_nat: NatType,
    peer_cone_addr: Option<SocketAddr>,
    peer_ip: IpAddr,
    timeout: Duration,
) -> Result<SocketAddr> {
    let strategy = select_strategy(local_nat, peer_nat)?;
    debug!("punch strategy {:?} peer_ip {}", strategy, peer_ip);
    let fut = async {
        match strategy {
            PunchStrategy::ConeToCone | PunchStrategy::SymmetricToCone => {
                let ra = peer_cone_addr.ok_or_else(|| {
                    NetworkError::Punch("peer cone mapping not advertised".to_string())
                })?;
                punch_dial(socket, ra).await
            }
            PunchStrategy::ConeToSymmetric => punch_listen(socket, peer_ip).await,
        }
    };
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| NetworkError::Timeout)?
}

/// Send hellos to the peer's mapping until either side's datagram lands.
async fn punch_dial(socket: &UdpSocket, ra: SocketAddr) -> Result<SocketAddr> {
    let hello = frame::encode_frame(main_type::P2P, p2p::PUNCH_HELLO, &[]);
    let ack = frame::encode_frame(main_type::P2P, p2p::PUNCH_ACK, &[]);
    let mut tick = tokio::time::interval(HELLO_INTERVAL);
    let mut buf = vec![0u8; 256];

    loop {
        tokio::select! {
            _ = tick.tick() => {
                socket.send_to(&hello, ra).await?;
            }
            received = socket.recv_from(&mut buf) => {
                let (n, from) = received?;
                if from.ip() != ra.ip() {
                    debug!("punch: datagram from stranger {}", from);
                    continue;
                }
                match frame::decode_frame(&buf[..n]) {
                    Ok((head, _)) if head.sub_type == p2p::PUNCH_HELLO => {
                        // peer's hello made it through; answer so it
                        // unblocks too
                        socket.send_to(&ack, from).await?;
                        debug!("punch dial: hello from {}", from);
                        return Ok(from);
                    }
                    Ok((head, _)) if head.sub_type == p2p::PUNCH_ACK => {
                        debug!("punch dial: ack from {}", from);
                        return Ok(from);
                    }
                    _ => continue,
                }
            }
        }
    }
}

/// Wait on our own hole for the peer's hello, answer it, and report the
/// peer's fresh mapping.
async fn punch_listen(socket: &UdpSocket, peer_ip: IpAddr) -> Result<SocketAddr> {
    let ack = frame::encode_frame(main_type::P2P, p2p::PUNCH_ACK, &[]);
    let mut buf = vec![0u8; 256];

    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        if from.ip() != peer_ip {
            debug!("punch: datagram from stranger {}", from);
            continue;
        }
        match frame::decode_frame(&buf[..n]) {
            Ok((head, _)) if head.sub_type == p2p::PUNCH_HELLO => {
                socket.send_to(&ack, from).await?;
                debug!("punch listen: hello from {}", from);
                return Ok(from);
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The 2×2 dispatch table, exactly.
    #[test]
    fn test_strategy_table() {
        assert_eq!(
            select_strategy(NatType::Cone, NatType::Cone).unwrap(),
            PunchStrategy::ConeToCone
        );
        assert_eq!(
            select_strategy(NatType::Cone, NatType::Symmetric).unwrap(),
            PunchStrategy::ConeToSymmetric
        );
        assert_eq!(
            select_strategy(NatType::Symmetric, NatType::Cone).unwrap(),
            PunchStrategy::SymmetricToCone
        );
        assert!(matches!(
            select_strategy(NatType::Symmetric, NatType::Symmetric),
            Err(NetworkError::SymmetricSymmetric)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cone_cone_punch() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let side_a = tokio::spawn(async move {
            punch(
                &a,
                NatType::Cone,
                NatType::Cone,
                Some(b_addr),
                b_addr.ip(),
                Duration::from_secs(5),
            )
            .await
        });
        let side_b = tokio::spawn(async move {
            punch(
                &b,
                NatType::Cone,
                NatType::Cone,
                Some(a_addr),
                a_addr.ip(),
                Duration::from_secs(5),
            )
            .await
        });

        assert_eq!(side_a.await.unwrap().unwrap(), b_addr);
        assert_eq!(side_b.await.unwrap().unwrap(), a_addr);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cone_symmetric_punch() {
        // cone side listens on its hole, "symmetric" side dials it
        let cone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let symmetric = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cone_addr = cone.local_addr().unwrap();
        let symmetric_addr = symmetric.local_addr().unwrap();

        let cone_side = tokio::spawn(async move {
            punch(
                &cone,
                NatType::Cone,
                NatType::Symmetric,
                None,
                symmetric_addr.ip(),
                Duration::from_secs(5),
            )
            .await
        });
        let symmetric_side = tokio::spawn(async move {
            punch(
                &symmetric,
                NatType::Symmetric,
                NatType::Cone,
                Some(cone_addr),
                cone_addr.ip(),
                Duration::from_secs(5),
            )
            .await
        });

        // cone learns the symmetric side's actual source address
        assert_eq!(cone_side.await.unwrap().unwrap(), symmetric_addr);
        assert_eq!(symmetric_side.await.unwrap().unwrap(), cone_addr);
    }

    #[tokio::test]
    async fn test_symmetric_symmetric_refused() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let result = punch(
            &socket,
            NatType::Symmetric,
            NatType::Symmetric,
            None,
            "127.0.0.1".parse().unwrap(),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(NetworkError::SymmetricSymmetric)));
    }

    #[tokio::test]
    async fn test_punch_times_out_without_peer() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let result = punch(
            &socket,
            NatType::Cone,
            NatType::Cone,
            Some("127.0.0.1:9".parse().unwrap()),
            "127.0.0.1".parse().unwrap(),
            Duration::from_millis(300),
        )
        .await;
        assert!(matches!(result, Err(NetworkError::Timeout)));
    }

    #[tokio::test]
    async fn test_punch_ignores_strangers() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener_addr = listener.local_addr().unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // a stranger datagram must not complete the punch; with only the
        // stranger sending, the listen side times out
        let handle = tokio::spawn(async move {
            punch(
                &listener,
                NatType::Cone,
                NatType::Symmetric,
                None,
                "203.0.113.9".parse().unwrap(), // expected peer, never sends
                Duration::from_millis(400),
            )
            .await
        });
        let hello = frame::encode_frame(main_type::P2P, p2p::PUNCH_HELLO, &[]);
        stranger.send_to(&hello, listener_addr).await.unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            Err(NetworkError::Timeout)
        ));
    }
}
