//! Burrow tunnel protocol
//!
//! Everything above the raw transports: the frame-typed wire messages, the
//! per-peer tunnel runtime (signaling, underlay selection, heartbeat, demux
//! loop, overlay and relay tables), the app layer riding on tunnels, and
//! the network registry with its rendezvous client, clock sync, and retry
//! scheduler.

#![forbid(unsafe_code)]

pub mod app;
pub mod error;
pub mod network;
pub mod timings;
pub mod tunnel;
pub mod wire;

pub use app::App;
pub use error::ProtocolError;
pub use network::{Network, OverlayEvent};
pub use tunnel::Tunnel;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
