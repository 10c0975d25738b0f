//! JSON control-message bodies
//!
//! Field names are the wire contract; every deployed peer serializes them
//! PascalCase. Bodies ride either the rendezvous WebSocket (push messages)
//! or an established tunnel (overlay/relay control).

use burrow_net::{LinkMode, NatType};
use serde::{Deserialize, Serialize};

/// Login to the rendezvous service after the WebSocket opens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginReq {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "Token")]
    pub token: u64,
    #[serde(rename = "Version")]
    pub version: String,
}

/// Server answer to [`LoginReq`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRsp {
    #[serde(rename = "Error", default)]
    pub error: i32,
    #[serde(rename = "Detail", default)]
    pub detail: String,
    /// Server wall clock in nanoseconds, seeds the clock sync
    #[serde(rename = "Ts", default)]
    pub ts: i64,
}

/// Rendezvous heartbeat; the server echoes with its own timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkHeartbeat {
    /// Sender wall clock in nanoseconds
    #[serde(rename = "Ts")]
    pub ts: i64,
}

/// Ask a peer to build a tunnel back to us
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConnectReq {
    #[serde(rename = "Token")]
    pub token: u64,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "FromIP")]
    pub from_ip: String,
    #[serde(rename = "ConeNatPort")]
    pub cone_nat_port: u16,
    #[serde(rename = "NatType")]
    pub nat_type: NatType,
    #[serde(rename = "HasIPv4")]
    pub has_ipv4: u8,
    #[serde(rename = "IPv6", default)]
    pub ipv6: String,
    #[serde(rename = "HasUPNPorNATPMP")]
    pub has_upnp_or_natpmp: u8,
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "AppKey")]
    pub app_key: u64,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "LinkMode")]
    pub link_mode: LinkMode,
    /// The role the *receiver* should take; complementary to the sender's
    #[serde(rename = "IsUnderlayServer")]
    pub is_underlay_server: u8,
}

/// Answer to [`PushConnectReq`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConnectRsp {
    #[serde(rename = "Error", default)]
    pub error: i32,
    #[serde(rename = "Detail", default)]
    pub detail: String,
    #[serde(rename = "To", default)]
    pub to: String,
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "NatType")]
    pub nat_type: NatType,
    #[serde(rename = "HasIPv4")]
    pub has_ipv4: u8,
    #[serde(rename = "IPv6", default)]
    pub ipv6: String,
    #[serde(rename = "HasUPNPorNATPMP")]
    pub has_upnp_or_natpmp: u8,
    #[serde(rename = "FromIP")]
    pub from_ip: String,
    #[serde(rename = "ConeNatPort")]
    pub cone_nat_port: u16,
    #[serde(rename = "ID")]
    pub id: u64,
    /// Shared punch instant in server-clock nanoseconds
    #[serde(rename = "PunchTs")]
    pub punch_ts: u64,
    #[serde(rename = "Version")]
    pub version: String,
}

/// App-level heartbeat forwarded across a relay hop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayHeartbeat {
    #[serde(rename = "RelayTunnelID")]
    pub relay_tunnel_id: u64,
    #[serde(rename = "AppID")]
    pub app_id: u64,
}

/// Ask a relay node for the ID of its tunnel to `peer_node`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayTunnelReq {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "PeerNode")]
    pub peer_node: String,
}

/// Answer to [`RelayTunnelReq`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayTunnelRsp {
    #[serde(rename = "TunnelID", default)]
    pub tunnel_id: u64,
    #[serde(rename = "Error", default)]
    pub error: i32,
    #[serde(rename = "Detail", default)]
    pub detail: String,
}

/// Announce an overlay connection and install its key on the peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConnectReq {
    #[serde(rename = "AppID")]
    pub app_id: u64,
    #[serde(rename = "ID")]
    pub id: u64,
}

/// Tear down an overlay connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayDisconnectReq {
    #[serde(rename = "ID")]
    pub id: u64,
}
