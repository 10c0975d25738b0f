//! Built-in defaults and the deterministic identity derivations

/// Default rendezvous host
pub const DEFAULT_SERVER_HOST: &str = "api.openp2p.cn";

/// Default rendezvous WebSocket port
pub const WS_PORT: u16 = 27183;

/// First NAT probe UDP port on the rendezvous server
pub const UDP_PORT1: u16 = 27182;

/// Second NAT probe UDP port; a differing mapping against this one marks
/// the NAT as symmetric
pub const UDP_PORT2: u16 = 27183;

/// TCP echo port used to learn a TCP mapping before TCP punching
pub const TCP_PROBE_PORT: u16 = 27180;

/// Node names shorter than this are padded
pub const MIN_NODE_NAME_LEN: usize = 8;

/// Node names longer than this are truncated
pub const MAX_NODE_NAME_LEN: usize = 31;

/// Default relay bandwidth share in Mbps
pub const DEFAULT_SHARE_BANDWIDTH: i32 = 10;

/// Stable 64-bit ID for a node name.
pub fn node_name_to_id(name: &str) -> u64 {
    let hash = blake3::hash(name.as_bytes());
    let mut id = [0u8; 8];
    id.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(id)
}

/// The deterministic TCP port for a node: `hash(node) % 15000 + 50000`,
/// always within `[50000, 65000)`.
pub fn default_tcp_port(node: &str) -> u16 {
    (node_name_to_id(node) % 15000 + 50000) as u16
}

/// Derive the default node name from the hostname.
///
/// Truncated to the maximum length; short hostnames are padded with digits
/// derived from the hostname hash so the identity stays stable across
/// restarts.
pub fn default_node_name() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name: String = host
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(MAX_NODE_NAME_LEN)
        .collect();
    if name.is_empty() {
        name.push_str("node");
    }
    while name.len() < MIN_NODE_NAME_LEN {
        let fill = node_name_to_id(&name) % 10;
        name.push(char::from(b'0' + fill as u8));
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_is_pure() {
        assert_eq!(node_name_to_id("n1"), node_name_to_id("n1"));
        assert_ne!(node_name_to_id("n1"), node_name_to_id("n2"));
    }

    #[test]
    fn test_tcp_port_range() {
        for name in ["n1", "some-node", "x", "a-much-longer-node-name-here"] {
            let port = default_tcp_port(name);
            assert!((50000..65000).contains(&port), "{} -> {}", name, port);
        }
    }

    #[test]
    fn test_tcp_port_is_pure() {
        assert_eq!(default_tcp_port("n1"), default_tcp_port("n1"));
    }

    #[test]
    fn test_default_node_name_length() {
        let name = default_node_name();
        assert!(name.len() >= MIN_NODE_NAME_LEN);
        assert!(name.len() <= MAX_NODE_NAME_LEN);
    }

    #[test]
    fn test_default_node_name_stable() {
        assert_eq!(default_node_name(), default_node_name());
    }
}
