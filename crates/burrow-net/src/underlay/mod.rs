//! Underlay transports carrying framed tunnel traffic
//!
//! Four link modes share one byte-frame contract: write a typed frame, read
//! a typed frame, bounded reads, close. TCP over IPv4 (with a deterministic
//! local port so punching can reuse the mapping), TCP over IPv6, TCP with a
//! time-synchronized simultaneous open, and QUIC on top of a hole-punched
//! UDP socket. The variant set is a tagged enum; trait objects buy nothing
//! here since the set is closed.

pub mod frame;
pub mod quic;
pub mod tcp;
pub mod tls;

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;
use frame::FrameHeader;

/// How a tunnel's underlay was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Plain TCP over public IPv4
    Tcp4,
    /// Plain TCP over IPv6
    Tcp6,
    /// Simultaneous-open TCP through punched NAT mappings
    TcpPunch,
    /// QUIC over a hole-punched UDP socket
    UdpPunch,
}

impl std::fmt::Display for LinkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::TcpPunch => "tcppunch",
            Self::UdpPunch => "udppunch",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for LinkMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            "tcppunch" => Ok(Self::TcpPunch),
            "udppunch" => Ok(Self::UdpPunch),
            other => Err(format!("unknown link mode: {}", other)),
        }
    }
}

/// An established underlay connection, any variant.
pub enum Underlay {
    /// TCP4, TCP6 and TCP-punch links
    Tcp(tcp::TcpUnderlay),
    /// QUIC over the punched UDP socket
    Quic(quic::QuicUnderlay),
}

impl Underlay {
    /// Write one typed frame.
    pub async fn write(&mut self, main_type: u16, sub_type: u16, body: &[u8]) -> Result<()> {
        match self {
            Self::Tcp(u) => u.write(main_type, sub_type, body).await,
            Self::Quic(u) => u.write(main_type, sub_type, body).await,
        }
    }

    /// Read one frame, honoring the read deadline set beforehand.
    pub async fn read(&mut self) -> Result<(FrameHeader, Bytes)> {
        match self {
            Self::Tcp(u) => u.read().await,
            Self::Quic(u) => u.read().await,
        }
    }

    /// Bound every subsequent read; a read exceeding this fails with
    /// [`crate::NetworkError::Timeout`].
    pub fn set_read_deadline(&mut self, deadline: Duration) {
        match self {
            Self::Tcp(u) => u.set_read_deadline(deadline),
            Self::Quic(u) => u.set_read_deadline(deadline),
        }
    }

    /// Close the connection. Safe to call on an already-closed underlay.
    pub async fn close(&mut self) {
        match self {
            Self::Tcp(u) => u.close().await,
            Self::Quic(u) => u.close().await,
        }
    }

    /// Split into independently owned halves so a read loop and concurrent
    /// writers (heartbeat, relay) can run without sharing a lock on reads.
    pub fn split(self) -> (UnderlayReader, UnderlayWriter) {
        match self {
            Self::Tcp(u) => u.split(),
            Self::Quic(u) => u.split(),
        }
    }
}

pub(crate) enum ReaderInner {
    Tcp(tokio::net::tcp::OwnedReadHalf),
    Quic(quinn::RecvStream),
}

/// Owned read half of a split underlay
pub struct UnderlayReader {
    pub(crate) inner: ReaderInner,
    pub(crate) deadline: Option<Duration>,
}

impl UnderlayReader {
    /// Bound every subsequent read.
    pub fn set_read_deadline(&mut self, deadline: Duration) {
        self.deadline = Some(deadline);
    }

    /// Read one frame, honoring the deadline.
    pub async fn read(&mut self) -> Result<(FrameHeader, Bytes)> {
        let fut = async {
            match &mut self.inner {
                ReaderInner::Tcp(half) => frame::read_frame(half).await,
                ReaderInner::Quic(recv) => frame::read_frame(recv).await,
            }
        };
        match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, fut)
                .await
                .map_err(|_| crate::NetworkError::Timeout)?,
            None => fut.await,
        }
    }
}

pub(crate) enum WriterInner {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    Quic {
        send: quinn::SendStream,
        connection: quinn::Connection,
        // the endpoint drives IO for the connection; dropping it kills reads
        _endpoint: quinn::Endpoint,
    },
}

/// Owned write half of a split underlay
pub struct UnderlayWriter {
    pub(crate) inner: WriterInner,
}

impl UnderlayWriter {
    /// Write one typed frame.
    pub async fn write(&mut self, main_type: u16, sub_type: u16, body: &[u8]) -> Result<()> {
        match &mut self.inner {
            WriterInner::Tcp(half) => frame::write_frame(half, main_type, sub_type, body).await,
            WriterInner::Quic { send, .. } => {
                frame::write_frame(send, main_type, sub_type, body).await
            }
        }
    }

    /// Write pre-encoded frame bytes unchanged (relay forwarding).
    pub async fn write_raw(&mut self, frame_bytes: &[u8]) -> Result<()> {
        match &mut self.inner {
            WriterInner::Tcp(half) => frame::write_frame_raw(half, frame_bytes).await,
            WriterInner::Quic { send, .. } => frame::write_frame_raw(send, frame_bytes).await,
        }
    }

    /// Close the underlying connection. Idempotent.
    pub async fn close(&mut self) {
        match &mut self.inner {
            WriterInner::Tcp(half) => {
                use tokio::io::AsyncWriteExt;
                let _ = half.shutdown().await;
            }
            WriterInner::Quic { connection, .. } => {
                connection.close(0u32.into(), b"closed");
            }
        }
    }
}
