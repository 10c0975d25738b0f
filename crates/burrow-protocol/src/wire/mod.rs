//! Wire protocol: the shared frame header plus the typed message bodies
//!
//! The 8-byte header and the type constants live in `burrow_net` because
//! the transports and the puncher frame their traffic the same way; this
//! module re-exports them and adds the JSON control bodies and the payload
//! codec.

pub mod codec;
pub mod messages;
pub mod version;

pub use burrow_net::underlay::frame::{
    self, decode_frame, encode_frame, login, main_type, nat_probe, p2p, push, FrameHeader,
    HEADER_SIZE,
};
pub use codec::{encode_message, Payload, SubPacket};
pub use version::{compare_version, SYNC_SERVER_TIME_VERSION, VERSION};

/// Length of the overlay ID prefix in `OverlayData` bodies
pub const OVERLAY_HEADER_SIZE: usize = 8;

/// Length of the target-tunnel prefix in `RelayData` bodies
pub const RELAY_HEADER_SIZE: usize = 8;

/// Length of the from/to prefix in push bodies
pub const PUSH_HEADER_SIZE: usize = 16;

/// Literal 1-RTT greeting the dialing side sends
pub const HANDSHAKE_HELLO: &[u8] = b"OpenP2P,hello";

/// Literal 1-RTT greeting the listening side answers with
pub const HANDSHAKE_HELLO_ACK: &[u8] = b"OpenP2P,hello2";
