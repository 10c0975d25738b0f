//! Command-line surface
//!
//! Flags override environment overrides override the persisted config;
//! clap handles the first two, `main` merges into the store. A `-peernode`
//! flag defines (or overrides) one forwarding app inline.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "burrow", about = "Peer-to-peer NAT traversal tunnels", version)]
pub struct Cli {
    /// Rendezvous server host
    #[arg(long)]
    pub serverhost: Option<String>,

    /// Rendezvous server port (WebSocket)
    #[arg(long)]
    pub serverport: Option<u16>,

    /// 64-bit node token
    #[arg(long, env = "OPENP2P_TOKEN")]
    pub token: Option<u64>,

    /// Node name, 8-31 characters; defaults to a hostname derivation
    #[arg(long, env = "OPENP2P_NODE")]
    pub node: Option<String>,

    /// Peer node to forward to; providing this defines an app
    #[arg(long)]
    pub peernode: Option<String>,

    /// Destination host for the app
    #[arg(long, default_value = "127.0.0.1")]
    pub dstip: String,

    /// Destination port for the app
    #[arg(long, default_value_t = 0)]
    pub dstport: u16,

    /// Local source port for the app
    #[arg(long, default_value_t = 0)]
    pub srcport: u16,

    /// App protocol: tcp or udp
    #[arg(long, default_value = "tcp")]
    pub protocol: String,

    /// App display name
    #[arg(long, default_value = "")]
    pub appname: String,

    /// Whitelist for the app listener
    #[arg(long, default_value = "")]
    pub whitelist: String,

    /// Relay node to route the app through
    #[arg(long, default_value = "")]
    pub relaynode: String,

    /// Fixed local TCP port; default derives from the node name hash
    #[arg(long)]
    pub tcpport: Option<u16>,

    /// Relay bandwidth share in Mbps
    #[arg(long)]
    pub sharebandwidth: Option<i32>,

    /// Daemon mode (handled by the service manager, not in-process)
    #[arg(short = 'd', default_value_t = false)]
    pub daemon: bool,

    /// Log to file only, keep the console quiet
    #[arg(long, default_value_t = false)]
    pub nv: bool,

    /// Do not load the existing config.json
    #[arg(long, default_value_t = false)]
    pub newconfig: bool,

    /// 0 debug, 1 info, 2 warn, 3 error
    #[arg(long)]
    pub loglevel: Option<i32>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the version and exit
    Version,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_definition_flags() {
        let cli = Cli::parse_from([
            "burrow",
            "--node",
            "my-node-name",
            "--peernode",
            "peer-node-1",
            "--srcport",
            "8080",
            "--dstport",
            "80",
            "--protocol",
            "tcp",
        ]);
        assert_eq!(cli.node.as_deref(), Some("my-node-name"));
        assert_eq!(cli.peernode.as_deref(), Some("peer-node-1"));
        assert_eq!(cli.srcport, 8080);
        assert_eq!(cli.dstport, 80);
        assert_eq!(cli.dstip, "127.0.0.1");
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["burrow"]);
        assert!(cli.peernode.is_none());
        assert_eq!(cli.protocol, "tcp");
        assert!(!cli.newconfig);
        assert!(!cli.nv);
        assert!(cli.loglevel.is_none());
    }

    #[test]
    fn test_version_subcommand() {
        let cli = Cli::parse_from(["burrow", "version"]);
        assert!(matches!(cli.command, Some(Commands::Version)));
    }
}
