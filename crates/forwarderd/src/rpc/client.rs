//! RPC client used to reach the upstream manager.

use std::io;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::BufReader;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::rustls::pki_types::ServerName;

use forwarder_config::SocketEndpoint;

use crate::transport::{connect, read_frame, write_frame};

use super::{HANDSHAKE_TIMEOUT, RpcError, RpcRequest, RpcResponse, RpcStatus};

/// Client for one RPC endpoint.
///
/// Each call dials a fresh mutually authenticated connection, so credential
/// rotation takes effect on the next call.
#[derive(Clone)]
pub struct RpcClient {
    endpoint: SocketEndpoint,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Builds a client for `endpoint` using client-role credentials `tls`.
    pub fn new(endpoint: SocketEndpoint, tls: Arc<ClientConfig>) -> Result<Self, RpcError> {
        let name = endpoint.tls_server_name().to_owned();
        let server_name =
            ServerName::try_from(name.clone()).map_err(|_| RpcError::ServerName { name })?;
        Ok(Self {
            endpoint,
            connector: TlsConnector::from(tls),
            server_name,
        })
    }

    /// Endpoint the client dials.
    #[must_use]
    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// Calls `service`/`method` with a raw JSON payload.
    pub async fn call(&self, service: &str, method: &str, payload: Value) -> Result<Value, RpcError> {
        let stream = connect(&self.endpoint)
            .await
            .map_err(|source| RpcError::Connect {
                endpoint: self.endpoint.to_string(),
                source,
            })?;
        let handshake = self.connector.connect(self.server_name.clone(), stream);
        let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out")),
        }
        .map_err(|source| RpcError::Handshake {
            endpoint: self.endpoint.to_string(),
            source,
        })?;

        let mut stream = BufReader::new(tls);
        let request = RpcRequest {
            service: service.to_owned(),
            method: method.to_owned(),
            payload,
        };
        write_frame(stream.get_mut(), &request)
            .await
            .map_err(|source| RpcError::Io { source })?;
        let frame = read_frame(&mut stream)
            .await
            .map_err(|source| RpcError::Io { source })?
            .ok_or(RpcError::NoResponse)?;
        match serde_json::from_slice(&frame).map_err(|source| RpcError::Protocol { source })? {
            RpcResponse::Ok { payload } => Ok(payload),
            RpcResponse::Error { code, message } => Err(RpcError::Status {
                status: RpcStatus { code, message },
            }),
        }
    }

    /// Calls `service`/`method`, encoding `request` and decoding the reply.
    pub async fn invoke<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload =
            serde_json::to_value(request).map_err(|source| RpcError::Protocol { source })?;
        let reply = self.call(service, method, payload).await?;
        serde_json::from_value(reply).map_err(|source| RpcError::Protocol { source })
    }
}
