//! NAT classification and gateway probing

pub mod probe;
pub mod upnp;

use serde::{Deserialize, Serialize};

/// NAT type classification
///
/// The prober only distinguishes the two classes that matter for punching:
/// a cone NAT keeps one external mapping per internal socket, a symmetric
/// NAT assigns a fresh external port per destination and cannot be reached
/// through a pre-advertised mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    /// One external mapping per internal socket
    Cone,
    /// Fresh external port per destination
    Symmetric,
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cone => f.write_str("cone"),
            Self::Symmetric => f.write_str("symmetric"),
        }
    }
}
