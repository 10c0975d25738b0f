//! Burrow CLI - peer-to-peer NAT traversal tunnels

#![forbid(unsafe_code)]

mod cli;
mod logging;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info};

use burrow_store::{AppConfig, ConfigStore};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(Commands::Version) = cli.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return;
    }
    if cli.daemon {
        eprintln!("daemon mode is handled by the service manager; run in foreground");
        std::process::exit(2);
    }

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(ConfigStore::open("config.json", cli.newconfig));
    apply_flags(&config, &cli);

    let log_level = cli.loglevel.unwrap_or(config.snapshot().log_level);
    let _log_guard = logging::init(log_level, cli.nv);
    info!("burrow start, version {}", env!("CARGO_PKG_VERSION"));

    let (network, mut overlay_rx) = burrow_protocol::Network::connect(config)
        .await
        .context("network login failed")?;
    info!("logged in as {}", network.node());

    // the forwarded userland owns overlay payloads; nothing is wired up
    // here, so just account for them
    tokio::spawn(async move {
        while let Some(event) = overlay_rx.recv().await {
            debug!(
                "overlay {}:{} delivered {} bytes",
                event.tunnel_id,
                event.overlay_id,
                event.payload.len()
            );
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("signal listener failed")?;
    info!("shutting down");
    network.shutdown().await;
    Ok(())
}

/// Merge explicit flags into the persisted config; flags always win.
fn apply_flags(config: &ConfigStore, cli: &Cli) {
    if let Some(host) = &cli.serverhost {
        config.update(|c| c.network.server_host = host.clone());
    }
    if let Some(port) = cli.serverport {
        config.update(|c| c.network.server_port = port);
    }
    if let Some(token) = cli.token {
        config.set_token(token);
    }
    if let Some(node) = &cli.node {
        config.set_node(node);
    }
    if let Some(port) = cli.tcpport {
        config.update(|c| c.network.tcp_port = port);
    }
    if let Some(mbps) = cli.sharebandwidth {
        config.set_share_bandwidth(mbps);
    }
    if let Some(level) = cli.loglevel {
        config.update(|c| c.log_level = level);
    }

    if let Some(peer_node) = &cli.peernode {
        let protocol: burrow_store::Protocol = cli.protocol.parse().unwrap_or_default();
        let app = AppConfig {
            app_name: cli.appname.clone(),
            protocol,
            whitelist: cli.whitelist.clone(),
            src_port: cli.srcport,
            peer_node: peer_node.clone(),
            dst_port: cli.dstport,
            dst_host: cli.dstip.clone(),
            relay_node: cli.relaynode.clone(),
            enabled: 1,
            ..Default::default()
        };
        config.add_app(app, true);
    }
}
