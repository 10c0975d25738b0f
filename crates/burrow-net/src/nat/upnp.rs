//! UPnP/IGD gateway probe
//!
//! Uses igd-next to ask the local router for its presence and external IP.
//! The tunnel core only needs the yes/no answer (`HasUPNPorNATPMP` in the
//! signaling exchange); actual port mapping stays with the router's lease
//! defaults.

use std::net::SocketAddr;

use tracing::debug;

use crate::error::NetworkError;
use crate::Result;

/// Whether a UPnP/IGD gateway answers on this network. `1`/`0` to match the
/// wire field it feeds.
pub async fn probe_gateway() -> u8 {
    match igd_next::aio::tokio::search_gateway(Default::default()).await {
        Ok(gateway) => {
            debug!("upnp gateway found at {}", gateway.addr);
            1
        }
        Err(e) => {
            debug!("no upnp gateway: {}", e);
            0
        }
    }
}

/// External IP as reported by the gateway.
pub async fn get_external_ip() -> Result<std::net::IpAddr> {
    let gateway = igd_next::aio::tokio::search_gateway(Default::default())
        .await
        .map_err(|e| NetworkError::NatProbe(format!("UPnP gateway not found: {}", e)))?;

    gateway
        .get_external_ip()
        .await
        .map_err(|e| NetworkError::NatProbe(format!("failed to get external IP: {}", e)))
}

/// Add a port mapping on the local gateway.
///
/// Requests the router to forward `external_port` to `internal_addr` for
/// `duration_secs` seconds (0 = permanent).
pub async fn add_port_mapping(
    external_port: u16,
    internal_addr: SocketAddr,
    description: &str,
    duration_secs: u32,
) -> Result<u16> {
    let gateway = igd_next::aio::tokio::search_gateway(Default::default())
        .await
        .map_err(|e| NetworkError::NatProbe(format!("UPnP gateway not found: {}", e)))?;

    gateway
        .add_port(
            igd_next::PortMappingProtocol::TCP,
            external_port,
            internal_addr,
            duration_secs,
            description,
        )
        .await
        .map_err(|e| NetworkError::NatProbe(format!("UPnP port mapping failed: {}", e)))?;

    Ok(external_port)
}
