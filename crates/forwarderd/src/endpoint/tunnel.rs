//! Tunnel source address initialisation.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::dataplane::AgentConnection;

use super::{ENDPOINT_TARGET, EndpointError};

/// Agent configuration key holding the tunnel source address.
pub const TUNNEL_KEY: &str = "config/vpp/v2/tunnel/source";

/// Resolves the address remote tunnels originate from and prepares the
/// dataplane to use it.
#[async_trait]
pub trait TunnelInit: Send + Sync {
    /// Returns the tunnel source address after programming it into `agent`.
    async fn initialise(&self, agent: &AgentConnection) -> Result<IpAddr, EndpointError>;
}

/// Uses the configured address, or the address of the interface carrying the
/// default route when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AgentTunnelInit {
    configured: Option<IpAddr>,
}

impl AgentTunnelInit {
    /// Builds the initialiser.
    #[must_use]
    pub fn new(configured: Option<IpAddr>) -> Self {
        Self { configured }
    }
}

#[async_trait]
impl TunnelInit for AgentTunnelInit {
    async fn initialise(&self, agent: &AgentConnection) -> Result<IpAddr, EndpointError> {
        let address = match self.configured {
            Some(address) => address,
            None => default_route_address().map_err(|source| EndpointError::TunnelAddress { source })?,
        };
        agent
            .put(TUNNEL_KEY, &json!({ "ip": address }))
            .await
            .map_err(|source| EndpointError::Tunnel { source })?;
        info!(target: ENDPOINT_TARGET, tunnel_ip = %address, "tunnel source initialised");
        Ok(address)
    }
}

/// Local address the kernel would use to reach the outside world.
///
/// Connecting a UDP socket sends no packets; it only performs the route lookup.
fn default_route_address() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    socket.connect(SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 4789)))?;
    let address = socket.local_addr()?.ip();
    if address.is_unspecified() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no default route",
        ));
    }
    Ok(address)
}
