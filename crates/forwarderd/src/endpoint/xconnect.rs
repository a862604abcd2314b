//! The cross-connect endpoint.
//!
//! Serves `networkservice.NetworkService`. A `Request` is authorized, stamped
//! with this forwarder's path segment, forwarded to the upstream manager and,
//! once the upstream accepts, programmed into the dataplane agent. `Close`
//! unwinds the same steps in reverse.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use forwarder_identity::{Authorizer, SpiffeId, Token, TokenGenerator};

use crate::dataplane::AgentConnection;
use crate::rpc::{CallContext, RpcClient, RpcError, RpcServer, RpcService, RpcStatus};
use crate::scope::Scope;

use super::{
    Connection, ENDPOINT_TARGET, Endpoint, EndpointBuilder, EndpointError, EndpointParams,
    MECHANISM_MEMIF, Mechanism, NetworkServiceRequest, PathSegment, TunnelInit,
};

/// Service name the endpoint registers under.
pub const NETWORK_SERVICE: &str = "networkservice.NetworkService";

const METHOD_REQUEST: &str = "Request";
const METHOD_CLOSE: &str = "Close";

/// Builds [`XconnectEndpoint`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct XconnectBuilder;

#[async_trait]
impl EndpointBuilder for XconnectBuilder {
    async fn build(
        &self,
        _scope: &Scope,
        params: EndpointParams,
    ) -> Result<Arc<dyn Endpoint>, EndpointError> {
        let endpoint = XconnectEndpoint::new(params)?;
        Ok(Arc::new(endpoint))
    }
}

/// The cross-connect network service endpoint.
pub struct XconnectEndpoint {
    service: Arc<XconnectService>,
}

struct XconnectService {
    name: String,
    authorizer: Arc<dyn Authorizer>,
    tokens: Arc<dyn TokenGenerator>,
    agent: AgentConnection,
    base_dir: Utf8PathBuf,
    tunnel_init: Arc<dyn TunnelInit>,
    tunnel_ip: OnceCell<IpAddr>,
    upstream: RpcClient,
    connections: Mutex<HashMap<String, Connection>>,
}

impl XconnectEndpoint {
    /// Builds the endpoint and its upstream client.
    pub fn new(params: EndpointParams) -> Result<Self, EndpointError> {
        let upstream = RpcClient::new(params.connect_to.clone(), Arc::clone(&params.client_tls))
            .map_err(|source| EndpointError::Upstream { source })?;
        info!(
            target: ENDPOINT_TARGET,
            name = %params.name,
            upstream = %params.connect_to,
            base_dir = %params.base_dir,
            "xconnect endpoint built"
        );
        Ok(Self {
            service: Arc::new(XconnectService {
                name: params.name,
                authorizer: params.authorizer,
                tokens: params.tokens,
                agent: params.agent,
                base_dir: params.base_dir,
                tunnel_init: params.tunnel_init,
                tunnel_ip: OnceCell::new(),
                upstream,
                connections: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Handles a `Request` from `context`.
    pub async fn request(
        &self,
        context: &CallContext,
        request: NetworkServiceRequest,
    ) -> Result<Connection, RpcStatus> {
        self.service.request(context, request).await
    }

    /// Handles a `Close` from `context`.
    pub async fn close(&self, context: &CallContext, connection: Connection) -> Result<(), RpcStatus> {
        self.service.close(context, connection).await
    }

    /// Connections currently programmed into the dataplane.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        let mut connections: Vec<_> = self.service.table().values().cloned().collect();
        connections.sort_by(|left, right| left.id.cmp(&right.id));
        connections
    }
}

impl Endpoint for XconnectEndpoint {
    fn name(&self) -> &str {
        &self.service.name
    }

    fn register(&self, server: &mut RpcServer) {
        server.register(Arc::clone(&self.service) as Arc<dyn RpcService>);
    }
}

impl XconnectService {
    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn authorize(&self, context: &CallContext) -> Result<SpiffeId, RpcStatus> {
        let Some(peer) = context.peer.as_ref() else {
            return Err(RpcStatus::permission_denied(
                "caller presented no SPIFFE ID",
            ));
        };
        self.authorizer
            .authorize(peer)
            .map_err(|error| RpcStatus::permission_denied(error.to_string()))?;
        Ok(peer.clone())
    }

    async fn tunnel_ip(&self) -> Result<IpAddr, RpcStatus> {
        self.tunnel_ip
            .get_or_try_init(|| self.tunnel_init.initialise(&self.agent))
            .await
            .copied()
            .map_err(|error| RpcStatus::unavailable(error.to_string()))
    }

    async fn request(
        &self,
        context: &CallContext,
        mut request: NetworkServiceRequest,
    ) -> Result<Connection, RpcStatus> {
        let peer = self.authorize(context)?;
        let tunnel_ip = self.tunnel_ip().await?;
        let token = self
            .tokens
            .generate(Some(&peer))
            .map_err(|error| RpcStatus::internal(error.to_string()))?;

        let connection = &mut request.connection;
        self.stamp(connection, token);
        if let Some(mechanism) = connection.mechanism.as_mut() {
            self.prepare(mechanism, &connection.id, tunnel_ip);
        }
        let id = connection.id.clone();
        for mechanism in &mut request.mechanism_preferences {
            self.prepare(mechanism, &id, tunnel_ip);
        }

        let accepted: Connection = invoke(&self.upstream, METHOD_REQUEST, &request).await?;
        let value = serde_json::to_value(&accepted)
            .map_err(|error| RpcStatus::internal(error.to_string()))?;
        if let Err(error) = self.agent.put(&xconnect_key(&accepted.id), &value).await {
            warn!(
                target: ENDPOINT_TARGET,
                connection = %accepted.id,
                error = %error,
                "dataplane rejected cross-connect; closing upstream"
            );
            if let Err(close_error) = invoke::<_, Value>(&self.upstream, METHOD_CLOSE, &accepted).await {
                warn!(target: ENDPOINT_TARGET, error = %close_error, "upstream close failed");
            }
            return Err(RpcStatus::unavailable(error.to_string()));
        }

        info!(
            target: ENDPOINT_TARGET,
            connection = %accepted.id,
            peer = %peer,
            "cross-connect established"
        );
        self.table().insert(accepted.id.clone(), accepted.clone());
        Ok(accepted)
    }

    async fn close(&self, context: &CallContext, connection: Connection) -> Result<(), RpcStatus> {
        self.authorize(context)?;
        let known = self.table().remove(&connection.id);
        let connection = known.unwrap_or(connection);

        if let Err(error) = self.agent.delete(&xconnect_key(&connection.id)).await {
            warn!(
                target: ENDPOINT_TARGET,
                connection = %connection.id,
                error = %error,
                "failed to remove cross-connect from the dataplane"
            );
        }
        invoke::<_, Value>(&self.upstream, METHOD_CLOSE, &connection).await?;
        info!(target: ENDPOINT_TARGET, connection = %connection.id, "cross-connect closed");
        Ok(())
    }

    /// Records this forwarder as the next hop of `connection`.
    ///
    /// A refresh of a connection that already carries our segment at the
    /// current index replaces that segment instead of adding another.
    fn stamp(&self, connection: &mut Connection, token: Token) {
        let segment = PathSegment {
            name: self.name.clone(),
            id: connection.id.clone(),
            token: token.value,
            expires: unix_secs(token.expires_at),
        };
        let path = &mut connection.path;
        let current = usize::try_from(path.index).unwrap_or(usize::MAX);
        if path.segments.is_empty() {
            path.segments.push(segment);
            path.index = 0;
        } else if let Some(existing) = path
            .segments
            .get_mut(current)
            .filter(|existing| existing.name == self.name)
        {
            *existing = segment;
        } else {
            let next = current.saturating_add(1).min(path.segments.len());
            path.segments.truncate(next);
            path.segments.push(segment);
            path.index = u32::try_from(next).unwrap_or(u32::MAX);
        }
    }

    fn prepare(&self, mechanism: &mut Mechanism, connection_id: &str, tunnel_ip: IpAddr) {
        if mechanism.is_remote() {
            mechanism
                .parameters
                .insert("src_ip".to_owned(), tunnel_ip.to_string());
        } else if mechanism.kind == MECHANISM_MEMIF {
            let socket = self.base_dir.join(format!("{connection_id}.memif.sock"));
            mechanism
                .parameters
                .insert("socket_file".to_owned(), socket.to_string());
        }
    }
}

#[async_trait]
impl RpcService for XconnectService {
    fn name(&self) -> &str {
        NETWORK_SERVICE
    }

    async fn call(
        &self,
        context: &CallContext,
        method: &str,
        payload: Value,
    ) -> Result<Value, RpcStatus> {
        match method {
            METHOD_REQUEST => {
                let request = decode(payload)?;
                let connection = self.request(context, request).await?;
                serde_json::to_value(connection)
                    .map_err(|error| RpcStatus::internal(error.to_string()))
            }
            METHOD_CLOSE => {
                let connection = decode(payload)?;
                self.close(context, connection).await?;
                Ok(json!({}))
            }
            other => Err(RpcStatus::not_found(format!(
                "{NETWORK_SERVICE} has no method '{other}'"
            ))),
        }
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, RpcStatus> {
    serde_json::from_value(payload).map_err(|error| RpcStatus::invalid_request(error.to_string()))
}

async fn invoke<Req, Resp>(upstream: &RpcClient, method: &str, request: &Req) -> Result<Resp, RpcStatus>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    upstream
        .invoke(NETWORK_SERVICE, method, request)
        .await
        .map_err(|error| match error {
            RpcError::Status { status } => status,
            other => RpcStatus::unavailable(other.to_string()),
        })
}

fn xconnect_key(id: &str) -> String {
    format!("config/xconnect/{id}")
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
