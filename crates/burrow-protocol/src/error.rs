//! Protocol error types

use std::fmt;

use burrow_net::NetworkError;

/// Protocol-layer errors
#[derive(Debug)]
pub enum ProtocolError {
    /// No signaling answer within the budget
    SignalingTimeout,
    /// Peer or server rejected the signaling exchange
    SignalingRejected(String),
    /// Punch or underlay 1-RTT handshake failed
    Handshake(String),
    /// Both peers symmetric; this link mode cannot work
    SymmetricPeers,
    /// Malformed frame or JSON body
    FrameDecode(String),
    /// Tunnel is gone or was never established
    TunnelClosed,
    /// Rendezvous WebSocket failure
    Rendezvous(String),
    /// Underlying transport error
    Net(NetworkError),
    /// IO error
    Io(std::io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignalingTimeout => write!(f, "Signaling timed out"),
            Self::SignalingRejected(detail) => write!(f, "Signaling rejected: {}", detail),
            Self::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
            Self::SymmetricPeers => {
                write!(f, "Both peers behind symmetric NAT; direct link impossible")
            }
            Self::FrameDecode(msg) => write!(f, "Frame decode failed: {}", msg),
            Self::TunnelClosed => write!(f, "Tunnel closed"),
            Self::Rendezvous(msg) => write!(f, "Rendezvous error: {}", msg),
            Self::Net(err) => write!(f, "Network error: {}", err),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<NetworkError> for ProtocolError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::SymmetricSymmetric => Self::SymmetricPeers,
            other => Self::Net(other),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::FrameDecode(err.to_string())
    }
}
