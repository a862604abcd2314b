//! The network service endpoint chain.
//!
//! The endpoint is built in phase 4 from everything the earlier phases
//! produced and is registered on the RPC server in phase 5.

mod model;
mod tunnel;
mod xconnect;

use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use thiserror::Error;
use tokio_rustls::rustls::ClientConfig;

use forwarder_config::SocketEndpoint;
use forwarder_identity::{Authorizer, TokenGenerator};

use crate::dataplane::{AgentConnection, AgentError};
use crate::rpc::{RpcError, RpcServer};
use crate::scope::Scope;

pub use self::model::{
    Connection, Mechanism, NetworkServiceRequest, Path, PathSegment, MECHANISM_KERNEL,
    MECHANISM_MEMIF, MECHANISM_VXLAN, MECHANISM_WIREGUARD,
};
pub use self::tunnel::{AgentTunnelInit, TunnelInit};
pub use self::xconnect::{NETWORK_SERVICE, XconnectBuilder, XconnectEndpoint};

const ENDPOINT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::endpoint");

/// Everything the endpoint chain is built from.
#[derive(Clone)]
pub struct EndpointParams {
    /// Name stamped into path segments.
    pub name: String,
    /// Per-request authorization policy.
    pub authorizer: Arc<dyn Authorizer>,
    /// Issues the tokens stamped into path segments.
    pub tokens: Arc<dyn TokenGenerator>,
    /// Connection to the dataplane agent.
    pub agent: AgentConnection,
    /// Directory for files the chain creates.
    pub base_dir: Utf8PathBuf,
    /// Resolves and programs the tunnel source address.
    pub tunnel_init: Arc<dyn TunnelInit>,
    /// Upstream endpoint requests are forwarded to.
    pub connect_to: SocketEndpoint,
    /// Client credentials for the upstream connection.
    pub client_tls: Arc<ClientConfig>,
}

impl std::fmt::Debug for EndpointParams {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("EndpointParams")
            .field("name", &self.name)
            .field("authorizer", &self.authorizer)
            .field("tokens", &self.tokens)
            .field("agent", &self.agent)
            .field("base_dir", &self.base_dir)
            .field("connect_to", &self.connect_to)
            .finish_non_exhaustive()
    }
}

/// A built endpoint ready to be served.
pub trait Endpoint: Send + Sync {
    /// Name of the endpoint.
    fn name(&self) -> &str;

    /// Registers the endpoint's services on `server`.
    fn register(&self, server: &mut RpcServer);
}

/// Builds the endpoint chain.
#[async_trait]
pub trait EndpointBuilder: Send + Sync {
    /// Builds an endpoint from `params`, living as long as `scope`.
    async fn build(
        &self,
        scope: &Scope,
        params: EndpointParams,
    ) -> Result<Arc<dyn Endpoint>, EndpointError>;
}

/// Failures while building or running the endpoint chain.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The upstream client could not be built.
    #[error("failed to build upstream client: {source}")]
    Upstream {
        /// Client error.
        #[source]
        source: RpcError,
    },
    /// No tunnel address was configured and none could be detected.
    #[error("failed to determine tunnel address: {source}")]
    TunnelAddress {
        /// Detection error.
        #[source]
        source: std::io::Error,
    },
    /// The dataplane agent refused the tunnel configuration.
    #[error("failed to program tunnel: {source}")]
    Tunnel {
        /// Agent error.
        #[source]
        source: AgentError,
    },
}
