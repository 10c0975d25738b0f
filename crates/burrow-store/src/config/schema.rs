//! The `config.json` schema
//!
//! PascalCase member names are the on-disk contract. Runtime fields carry
//! facts learned after startup (public addresses, NAT class, peer state)
//! and are never persisted.

use std::time::Instant;

use burrow_net::{LinkMode, NatType};
use serde::{Deserialize, Serialize};

use super::defaults;

/// Forwarded protocol of an app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Tcp
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// Local node identity and rendezvous coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "Token", default)]
    pub token: u64,
    #[serde(rename = "Node", default)]
    pub node: String,
    #[serde(rename = "User", default)]
    pub user: String,
    #[serde(rename = "ShareBandwidth", default = "default_share_bandwidth")]
    pub share_bandwidth: i32,
    #[serde(rename = "ServerHost", default = "default_server_host")]
    pub server_host: String,
    #[serde(rename = "ServerPort", default = "default_server_port")]
    pub server_port: u16,
    #[serde(rename = "UDPPort1", default = "default_udp_port1")]
    pub udp_port1: u16,
    #[serde(rename = "UDPPort2", default = "default_udp_port2")]
    pub udp_port2: u16,
    #[serde(rename = "TCPPort", default)]
    pub tcp_port: u16,

    // facts learned at startup, never persisted
    #[serde(skip)]
    pub public_ip: String,
    #[serde(skip)]
    pub public_ipv6: String,
    #[serde(skip)]
    pub local_ip: String,
    #[serde(skip)]
    pub nat_type: Option<NatType>,
    #[serde(skip)]
    pub has_ipv4: u8,
    #[serde(skip)]
    pub has_upnp_or_natpmp: u8,
}

fn default_share_bandwidth() -> i32 {
    defaults::DEFAULT_SHARE_BANDWIDTH
}

fn default_server_host() -> String {
    defaults::DEFAULT_SERVER_HOST.to_string()
}

fn default_server_port() -> u16 {
    defaults::WS_PORT
}

fn default_udp_port1() -> u16 {
    defaults::UDP_PORT1
}

fn default_udp_port2() -> u16 {
    defaults::UDP_PORT2
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            token: 0,
            node: String::new(),
            user: String::new(),
            share_bandwidth: default_share_bandwidth(),
            server_host: default_server_host(),
            server_port: default_server_port(),
            udp_port1: default_udp_port1(),
            udp_port2: default_udp_port2(),
            tcp_port: 0,
            public_ip: String::new(),
            public_ipv6: String::new(),
            local_ip: String::new(),
            nat_type: None,
            has_ipv4: 0,
            has_upnp_or_natpmp: 0,
        }
    }
}

/// One declarative forwarding rule, keyed by `(Protocol, SrcPort)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(rename = "AppName", default)]
    pub app_name: String,
    #[serde(rename = "Protocol", default)]
    pub protocol: Protocol,
    #[serde(rename = "Whitelist", default)]
    pub whitelist: String,
    #[serde(rename = "SrcPort", default)]
    pub src_port: u16,
    #[serde(rename = "PeerNode", default)]
    pub peer_node: String,
    #[serde(rename = "DstPort", default)]
    pub dst_port: u16,
    #[serde(rename = "DstHost", default)]
    pub dst_host: String,
    #[serde(rename = "PeerUser", default)]
    pub peer_user: String,
    #[serde(rename = "RelayNode", default)]
    pub relay_node: String,
    #[serde(rename = "Enabled", default = "default_enabled")]
    pub enabled: u8,

    // peer facts from the signaling exchange, never persisted
    #[serde(skip)]
    pub peer_version: String,
    #[serde(skip)]
    pub peer_token: u64,
    #[serde(skip)]
    pub from_token: u64,
    #[serde(skip)]
    pub peer_nat_type: Option<NatType>,
    #[serde(skip)]
    pub peer_has_ipv4: u8,
    #[serde(skip)]
    pub peer_ipv6: String,
    #[serde(skip)]
    pub peer_has_upnp_or_natpmp: u8,
    #[serde(skip)]
    pub peer_ip: String,
    #[serde(skip)]
    pub peer_cone_nat_port: u16,
    #[serde(skip)]
    pub link_mode: Option<LinkMode>,
    #[serde(skip)]
    pub is_underlay_server: u8,

    // retry bookkeeping, never persisted
    #[serde(skip)]
    pub retry_num: u32,
    #[serde(skip)]
    pub next_retry_time: Option<Instant>,
    #[serde(skip)]
    pub err_msg: String,
}

fn default_enabled() -> u8 {
    1
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            protocol: Protocol::Tcp,
            whitelist: String::new(),
            src_port: 0,
            peer_node: String::new(),
            dst_port: 0,
            dst_host: String::new(),
            peer_user: String::new(),
            relay_node: String::new(),
            enabled: default_enabled(),
            peer_version: String::new(),
            peer_token: 0,
            from_token: 0,
            peer_nat_type: None,
            peer_has_ipv4: 0,
            peer_ipv6: String::new(),
            peer_has_upnp_or_natpmp: 0,
            peer_ip: String::new(),
            peer_cone_nat_port: 0,
            link_mode: None,
            is_underlay_server: 0,
            retry_num: 0,
            next_retry_time: None,
            err_msg: String::new(),
        }
    }
}

impl AppConfig {
    /// Stable string ID: protocol then source port, e.g. `tcp8080`.
    pub fn id(&self) -> String {
        format!("{}{}", self.protocol, self.src_port)
    }

    /// Uniqueness key within the app list.
    pub fn key(&self) -> (Protocol, u16) {
        (self.protocol, self.src_port)
    }
}

/// Root of `config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "network", default)]
    pub network: NetworkConfig,
    #[serde(rename = "apps", default)]
    pub apps: Vec<AppConfig>,
    #[serde(rename = "LogLevel", default = "default_log_level")]
    pub log_level: i32,
}

fn default_log_level() -> i32 {
    1 // info
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            apps: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Fill derived defaults: node name from the hostname, TCP port from
    /// the node-name hash.
    pub fn apply_defaults(&mut self) {
        if self.network.node.is_empty() {
            self.network.node = super::defaults::default_node_name();
        }
        if self.network.tcp_port == 0 {
            self.network.tcp_port = super::defaults::default_tcp_port(&self.network.node);
        }
    }
}
