//! Payload encoding polymorphism
//!
//! A frame body is one of three things: raw bytes taken verbatim, a wrapper
//! that retypes an inner packet without re-serializing it, or a value that
//! serializes to JSON. The closed set is a tagged enum and the encoder is a
//! match that walks wrappers down to the terminal case.

use bytes::Bytes;
use serde::Serialize;

use super::frame;
use crate::{ProtocolError, Result};

/// A frame body before encoding
#[derive(Debug, Clone)]
pub enum Payload {
    /// Bytes that go on the wire verbatim
    Raw(Bytes),
    /// Retyping wrapper: encoding forwards to the inner packet
    Wrapped(Box<SubPacket>),
    /// Anything else: serialized as JSON
    Json(serde_json::Value),
}

impl Payload {
    /// Encode to wire bytes, walking wrappers.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Raw(bytes) => Ok(bytes.to_vec()),
            Self::Wrapped(inner) => inner.payload.encode(),
            Self::Json(value) => {
                serde_json::to_vec(value).map_err(|e| ProtocolError::FrameDecode(e.to_string()))
            }
        }
    }
}

/// A sub-typed packet: the effective sub type plus its body
#[derive(Debug, Clone)]
pub struct SubPacket {
    /// Effective sub type written to the header
    pub sub_type: u16,
    /// Body
    pub payload: Payload,
}

impl SubPacket {
    /// Raw bytes under a sub type.
    pub fn raw(sub_type: u16, bytes: impl Into<Bytes>) -> Self {
        Self {
            sub_type,
            payload: Payload::Raw(bytes.into()),
        }
    }

    /// JSON-serialized value under a sub type.
    pub fn json<T: Serialize>(sub_type: u16, value: &T) -> Result<Self> {
        Ok(Self {
            sub_type,
            payload: Payload::Json(
                serde_json::to_value(value).map_err(|e| ProtocolError::FrameDecode(e.to_string()))?,
            ),
        })
    }

    /// Retype an existing packet without re-serializing its body.
    pub fn retyped(sub_type: u16, inner: SubPacket) -> Self {
        Self {
            sub_type,
            payload: Payload::Wrapped(Box::new(inner)),
        }
    }

    /// Encode as a complete frame under `main_type`.
    pub fn to_frame(&self, main_type: u16) -> Result<Vec<u8>> {
        let body = self.payload.encode()?;
        Ok(frame::encode_frame(main_type, self.sub_type, &body))
    }
}

/// Encode a JSON message straight to frame bytes.
pub fn encode_message<T: Serialize>(main_type: u16, sub_type: u16, value: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(value).map_err(|e| ProtocolError::FrameDecode(e.to_string()))?;
    Ok(frame::encode_frame(main_type, sub_type, &body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{main_type, p2p};
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Probe {
        #[serde(rename = "A")]
        a: u32,
    }

    #[test]
    fn test_raw_payload_verbatim() {
        let packet = SubPacket::raw(p2p::TUNNEL_HANDSHAKE, &b"OpenP2P,hello"[..]);
        assert_eq!(packet.payload.encode().unwrap(), b"OpenP2P,hello");
    }

    #[test]
    fn test_json_payload() {
        let packet = SubPacket::json(p2p::OVERLAY_CONNECT_REQ, &Probe { a: 7 }).unwrap();
        let body = packet.payload.encode().unwrap();
        let parsed: Probe = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, Probe { a: 7 });
    }

    /// Retyping changes the header sub type but not the body bytes.
    #[test]
    fn test_wrapper_retypes_without_reserializing() {
        let inner = SubPacket::json(p2p::RELAY_HEARTBEAT, &Probe { a: 42 }).unwrap();
        let inner_body = inner.payload.encode().unwrap();

        let retyped = SubPacket::retyped(p2p::RELAY_HEARTBEAT_ACK, inner);
        assert_eq!(retyped.sub_type, p2p::RELAY_HEARTBEAT_ACK);
        assert_eq!(retyped.payload.encode().unwrap(), inner_body);
    }

    #[test]
    fn test_nested_wrappers_walk_to_terminal() {
        let raw = SubPacket::raw(1, &b"xyz"[..]);
        let once = SubPacket::retyped(2, raw);
        let twice = SubPacket::retyped(3, once);
        assert_eq!(twice.payload.encode().unwrap(), b"xyz");
        assert_eq!(twice.sub_type, 3);
    }

    #[test]
    fn test_to_frame_header_fields() {
        let packet = SubPacket::raw(p2p::OVERLAY_DATA, &b"data"[..]);
        let frame_bytes = packet.to_frame(main_type::P2P).unwrap();
        let (head, body) = frame::decode_frame(&frame_bytes).unwrap();
        assert_eq!(head.main_type, main_type::P2P);
        assert_eq!(head.sub_type, p2p::OVERLAY_DATA);
        assert_eq!(&body[..], b"data");
    }

    #[test]
    fn test_encode_message_roundtrip() {
        let frame_bytes =
            encode_message(main_type::P2P, p2p::RELAY_HEARTBEAT, &Probe { a: 1 }).unwrap();
        let (head, body) = frame::decode_frame(&frame_bytes).unwrap();
        assert_eq!(head.sub_type, p2p::RELAY_HEARTBEAT);
        let parsed: Probe = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.a, 1);
    }
}
