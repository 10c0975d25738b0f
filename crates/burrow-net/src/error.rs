//! Network error types

use std::fmt;

/// Network layer errors
#[derive(Debug)]
pub enum NetworkError {
    /// Outbound underlay connection failed
    Dial(String),
    /// Inbound underlay listen/accept failed
    Listen(String),
    /// Operation timed out
    Timeout,
    /// Hole punch handshake failed
    Punch(String),
    /// Both peers are behind symmetric NAT; this link mode cannot work
    SymmetricSymmetric,
    /// NAT probe against the rendezvous server failed
    NatProbe(String),
    /// Frame header or body malformed
    FrameDecode(String),
    /// TLS error
    Tls(String),
    /// IO error
    Io(std::io::Error),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dial(msg) => write!(f, "Dial failed: {}", msg),
            Self::Listen(msg) => write!(f, "Listen failed: {}", msg),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Punch(msg) => write!(f, "Hole punch failed: {}", msg),
            Self::SymmetricSymmetric => {
                write!(f, "Both peers behind symmetric NAT; punching impossible")
            }
            Self::NatProbe(msg) => write!(f, "NAT probe failed: {}", msg),
            Self::FrameDecode(msg) => write!(f, "Frame decode failed: {}", msg),
            Self::Tls(msg) => write!(f, "TLS error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
