//! The 8-byte frame header shared by every underlay
//!
//! Wire layout, little-endian throughout:
//!
//! ```text
//! | DataLen : u32 | MainType : u16 | SubType : u16 | Body : DataLen bytes |
//! ```
//!
//! `DataLen` counts only the body. The same framing rides TCP streams, QUIC
//! streams, raw punch datagrams, and the rendezvous WebSocket, so this module
//! lives at the bottom of the crate graph and owns the type constants too.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{NetworkError, Result};

/// Encoded header length in bytes
pub const HEADER_SIZE: usize = 8;

/// Upper bound on a single frame body; a header announcing more than this
/// is treated as corruption and aborts the connection.
pub const MAX_BODY_LEN: u32 = 1024 * 1024;

/// Main message types partitioning the sub-type namespace
pub mod main_type {
    /// Rendezvous login exchange
    pub const LOGIN: u16 = 0;
    /// Rendezvous heartbeat carrying the server wall clock
    pub const HEARTBEAT: u16 = 1;
    /// NAT probe echo exchange
    pub const NAT_PROBE: u16 = 2;
    /// Server-forwarded push messages between nodes
    pub const PUSH: u16 = 3;
    /// Everything on an established tunnel
    pub const P2P: u16 = 4;
}

/// Sub types under [`main_type::P2P`]
pub mod p2p {
    pub const TUNNEL_HANDSHAKE: u16 = 1;
    pub const TUNNEL_HANDSHAKE_ACK: u16 = 2;
    pub const TUNNEL_HEARTBEAT: u16 = 3;
    pub const TUNNEL_HEARTBEAT_ACK: u16 = 4;
    pub const OVERLAY_CONNECT_REQ: u16 = 5;
    pub const OVERLAY_DISCONNECT_REQ: u16 = 6;
    pub const OVERLAY_DATA: u16 = 7;
    pub const RELAY_DATA: u16 = 8;
    pub const RELAY_HEARTBEAT: u16 = 9;
    pub const RELAY_HEARTBEAT_ACK: u16 = 10;
    pub const PUNCH_HELLO: u16 = 11;
    pub const PUNCH_ACK: u16 = 12;
}

/// Sub types under [`main_type::PUSH`]
pub mod push {
    pub const CONNECT_REQ: u16 = 1;
    pub const CONNECT_RSP: u16 = 2;
    pub const UNDERLAY_CONNECT: u16 = 3;
    pub const RELAY_TUNNEL_REQ: u16 = 4;
    pub const RELAY_TUNNEL_RSP: u16 = 5;
}

/// Sub types under [`main_type::LOGIN`]
pub mod login {
    pub const REQ: u16 = 1;
    pub const RSP: u16 = 2;
}

/// Sub types under [`main_type::NAT_PROBE`]
pub mod nat_probe {
    pub const REQ: u16 = 1;
    pub const RSP: u16 = 2;
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length in bytes (header excluded)
    pub data_len: u32,
    /// Namespace selector, see [`main_type`]
    pub main_type: u16,
    /// Message selector within the namespace
    pub sub_type: u16,
}

impl FrameHeader {
    /// Build a header for a body of the given length.
    pub fn new(main_type: u16, sub_type: u16, data_len: u32) -> Self {
        Self {
            data_len,
            main_type,
            sub_type,
        }
    }

    /// Encode to the 8-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&self.data_len.to_le_bytes());
        buf[4..6].copy_from_slice(&self.main_type.to_le_bytes());
        buf[6..8].copy_from_slice(&self.sub_type.to_le_bytes());
        buf
    }

    /// Decode from the 8-byte wire form.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(NetworkError::FrameDecode(format!(
                "header truncated: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            data_len: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            main_type: u16::from_le_bytes([buf[4], buf[5]]),
            sub_type: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }
}

/// Encode a whole frame into one buffer (for datagram transports and the
/// WebSocket, where a frame must be a single message).
pub fn encode_frame(main_type: u16, sub_type: u16, body: &[u8]) -> Vec<u8> {
    let head = FrameHeader::new(main_type, sub_type, body.len() as u32);
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&head.encode());
    buf.extend_from_slice(body);
    buf
}

/// Decode a whole frame from one buffer. Inverse of [`encode_frame`].
pub fn decode_frame(buf: &[u8]) -> Result<(FrameHeader, Bytes)> {
    let head = FrameHeader::decode(buf)?;
    let total = HEADER_SIZE + head.data_len as usize;
    if head.data_len > MAX_BODY_LEN {
        return Err(NetworkError::FrameDecode(format!(
            "body length {} exceeds limit",
            head.data_len
        )));
    }
    if buf.len() < total {
        return Err(NetworkError::FrameDecode(format!(
            "body truncated: want {} bytes, have {}",
            head.data_len,
            buf.len() - HEADER_SIZE
        )));
    }
    Ok((head, Bytes::copy_from_slice(&buf[HEADER_SIZE..total])))
}

/// Write one frame to a byte stream.
pub async fn write_frame<W>(writer: &mut W, main_type: u16, sub_type: u16, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = FrameHeader::new(main_type, sub_type, body.len() as u32);
    writer.write_all(&head.encode()).await?;
    if !body.is_empty() {
        writer.write_all(body).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Write pre-encoded frame bytes to a byte stream unchanged.
///
/// Relay forwarding uses this: the forwarded body already is a complete
/// frame and must not be re-fragmented or re-encoded.
pub async fn write_frame_raw<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from a byte stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<(FrameHeader, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut head_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut head_buf).await?;
    let head = FrameHeader::decode(&head_buf)?;
    if head.data_len > MAX_BODY_LEN {
        return Err(NetworkError::FrameDecode(format!(
            "body length {} exceeds limit",
            head.data_len
        )));
    }
    let mut body = vec![0u8; head.data_len as usize];
    reader.read_exact(&mut body).await?;
    Ok((head, Bytes::from(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let head = FrameHeader::new(main_type::P2P, p2p::OVERLAY_DATA, 4096);
        let encoded = head.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        let decoded = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, head);
    }

    /// Endianness is pinned: the literal wire bytes
    /// `01 00 00 00 | 30 00 | 40 00` are DataLen=1, MainType=0x30, SubType=0x40.
    #[test]
    fn test_header_little_endian() {
        let wire = [0x01, 0x00, 0x00, 0x00, 0x30, 0x00, 0x40, 0x00];
        let head = FrameHeader::decode(&wire).unwrap();
        assert_eq!(head.data_len, 1);
        assert_eq!(head.main_type, 0x0030);
        assert_eq!(head.sub_type, 0x0040);
    }

    #[test]
    fn test_frame_roundtrip() {
        let body = b"OpenP2P,hello";
        let buf = encode_frame(main_type::P2P, p2p::TUNNEL_HANDSHAKE, body);
        assert_eq!(buf.len(), HEADER_SIZE + body.len());
        let (head, decoded) = decode_frame(&buf).unwrap();
        assert_eq!(head.main_type, main_type::P2P);
        assert_eq!(head.sub_type, p2p::TUNNEL_HANDSHAKE);
        assert_eq!(head.data_len as usize, body.len());
        assert_eq!(&decoded[..], body);
    }

    #[test]
    fn test_empty_body_frame() {
        let buf = encode_frame(main_type::P2P, p2p::TUNNEL_HEARTBEAT, &[]);
        assert_eq!(buf.len(), HEADER_SIZE);
        let (head, body) = decode_frame(&buf).unwrap();
        assert_eq!(head.data_len, 0);
        assert!(body.is_empty());
    }

    #[test]
    fn test_decode_rejects_truncated_header() {
        assert!(FrameHeader::decode(&[1, 2, 3]).is_err());
        assert!(decode_frame(&[0x01, 0x00]).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        let mut buf = encode_frame(main_type::P2P, p2p::OVERLAY_DATA, b"0123456789");
        buf.truncate(buf.len() - 3);
        assert!(decode_frame(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_body() {
        let head = FrameHeader::new(main_type::P2P, p2p::OVERLAY_DATA, MAX_BODY_LEN + 1);
        let mut buf = head.encode().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        assert!(decode_frame(&buf).is_err());
    }

    #[tokio::test]
    async fn test_stream_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, main_type::P2P, p2p::OVERLAY_DATA, b"payload")
            .await
            .unwrap();
        let (head, body) = read_frame(&mut server).await.unwrap();
        assert_eq!(head.sub_type, p2p::OVERLAY_DATA);
        assert_eq!(&body[..], b"payload");
    }

    #[tokio::test]
    async fn test_stream_preserves_frame_order() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        for i in 0u16..10 {
            write_frame(&mut client, main_type::P2P, i, &[i as u8]).await.unwrap();
        }
        for i in 0u16..10 {
            let (head, body) = read_frame(&mut server).await.unwrap();
            assert_eq!(head.sub_type, i);
            assert_eq!(body[0], i as u8);
        }
    }
}
