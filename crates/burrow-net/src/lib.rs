//! Network layer for Burrow peer-to-peer tunnels
//!
//! Provides the underlay transports that carry framed tunnel traffic
//! (TCP over IPv4/IPv6, simultaneous-open TCP punch, QUIC over a punched
//! UDP socket), the NAT prober that classifies the local NAT, and the
//! time-synchronized hole puncher.

#![forbid(unsafe_code)]

pub mod error;
pub mod nat;
pub mod punch;
pub mod underlay;

// Re-exports
pub use error::NetworkError;
pub use nat::NatType;
pub use underlay::{LinkMode, Underlay, UnderlayReader, UnderlayWriter};

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;
