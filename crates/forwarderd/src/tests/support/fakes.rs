//! Shared fakes for forwarder tests.
//!
//! The fakes speak the real wire protocols: the agent answers JSON lines on a
//! loopback port and the upstream manager is a genuine mutual-TLS RPC server.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::BufReader;
use tokio::net::TcpListener;

use forwarder_config::SocketEndpoint;
use forwarder_identity::test_support::TestPki;
use forwarder_identity::{AuthorizeAny, mtls_client_config, mtls_server_config};
use tokio_rustls::rustls::ClientConfig;

use crate::dataplane::AgentConnection;
use crate::endpoint::{
    Connection, EndpointError, Mechanism, NETWORK_SERVICE, PathSegment, TunnelInit,
};
use crate::rpc::{CallContext, RpcServer, RpcService, RpcStatus, listen_and_serve};
use crate::scope::{CancelReason, Scope};
use crate::supervision::ErrorSignal;
use crate::telemetry::TelemetryHandle;
use crate::transport::{read_frame, write_frame};

/// Trust domain every test identity belongs to.
pub const TRUST_DOMAIN: &str = "example.org";

/// A scope that logs nowhere.
pub fn quiet_scope() -> Scope {
    Scope::new(TelemetryHandle::disabled(), Instant::now(), "forwarderd", "test")
}

/// Dataplane agent answering on a loopback port.
pub struct FakeAgent {
    /// Connection pointing at the fake.
    pub connection: AgentConnection,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeAgent {
    /// Starts an agent that accepts everything.
    pub async fn start() -> Self {
        Self::rejecting(None).await
    }

    /// Starts an agent that rejects puts under `prefix`.
    pub async fn rejecting(prefix: Option<&'static str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind agent");
        let port = listener.local_addr().expect("agent addr").port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut stream = BufReader::new(stream);
                let Ok(Some(frame)) = read_frame(&mut stream).await else {
                    continue;
                };
                let request: Value = serde_json::from_slice(&frame).expect("json request");
                let refused = prefix.is_some_and(|prefix| {
                    request["op"] == "put"
                        && request["key"].as_str().is_some_and(|key| key.starts_with(prefix))
                });
                record.lock().expect("lock").push(request);
                let reply = if refused {
                    json!({"status": "error", "message": "refused by test agent"})
                } else {
                    json!({"status": "ok"})
                };
                let _ = write_frame(stream.get_mut(), &reply).await;
            }
        });
        Self {
            connection: AgentConnection::new(SocketEndpoint::tcp("127.0.0.1", port)),
            requests,
        }
    }

    /// Requests received so far, pings excluded.
    pub fn requests(&self) -> Vec<Value> {
        self.requests
            .lock()
            .expect("lock")
            .iter()
            .filter(|request| request["op"] != "ping")
            .cloned()
            .collect()
    }
}

/// Tunnel initialiser that returns a fixed address and counts its calls.
#[derive(Debug)]
pub struct FixedTunnel {
    address: IpAddr,
    calls: AtomicUsize,
}

impl FixedTunnel {
    /// Always answers `address`.
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of initialisations performed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelInit for FixedTunnel {
    async fn initialise(&self, _agent: &AgentConnection) -> Result<IpAddr, EndpointError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.address)
    }
}

/// Upstream manager that accepts every request and records the traffic.
pub struct FakeManager {
    calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl RpcService for FakeManager {
    fn name(&self) -> &str {
        NETWORK_SERVICE
    }

    async fn call(
        &self,
        _context: &CallContext,
        method: &str,
        payload: Value,
    ) -> Result<Value, RpcStatus> {
        self.calls
            .lock()
            .expect("lock")
            .push((method.to_owned(), payload.clone()));
        match method {
            "Request" => {
                let mut connection: Connection = serde_json::from_value(payload["connection"].clone())
                    .map_err(|error| RpcStatus::invalid_request(error.to_string()))?;
                if connection.network_service == "refused" {
                    return Err(RpcStatus::permission_denied("service refused by manager"));
                }
                let mechanism = payload["mechanism_preferences"]
                    .get(0)
                    .cloned()
                    .map(serde_json::from_value::<Mechanism>)
                    .transpose()
                    .map_err(|error| RpcStatus::invalid_request(error.to_string()))?;
                connection.mechanism = connection.mechanism.or(mechanism);
                connection.path.segments.push(PathSegment {
                    name: "nsmgr".to_owned(),
                    id: format!("{}-upstream", connection.id),
                    token: "manager-token".to_owned(),
                    expires: 0,
                });
                serde_json::to_value(connection).map_err(|error| RpcStatus::internal(error.to_string()))
            }
            "Close" => Ok(json!({})),
            other => Err(RpcStatus::not_found(other.to_owned())),
        }
    }
}

/// A running upstream manager and the PKI its peers share.
pub struct Upstream {
    /// PKI issuing every identity in the test.
    pub pki: TestPki,
    /// Endpoint the manager listens on.
    pub endpoint: SocketEndpoint,
    /// Errors reported by the manager's server.
    pub errors: ErrorSignal,
    manager: Arc<FakeManager>,
    scope: Scope,
    _dir: TempDir,
}

impl Upstream {
    /// Starts a manager on a Unix socket in a fresh directory.
    pub fn start() -> Self {
        let pki = TestPki::new(TRUST_DOMAIN);
        let dir = TempDir::new().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("nsmgr.sock")).expect("utf-8 path");
        let endpoint = SocketEndpoint::unix(path);
        let (_publisher, live) = pki.live("/nsmgr");
        let tls = mtls_server_config(Arc::new(live), Arc::new(AuthorizeAny)).expect("server tls");
        let manager = Arc::new(FakeManager {
            calls: Mutex::new(Vec::new()),
        });
        let mut server = RpcServer::new(Arc::new(tls));
        server.register(Arc::clone(&manager) as Arc<dyn RpcService>);
        let scope = quiet_scope();
        let errors = listen_and_serve(&scope, &endpoint, server);
        Self {
            pki,
            endpoint,
            errors,
            manager,
            scope,
            _dir: dir,
        }
    }

    /// Client credentials for a workload at `path`.
    pub fn client_tls(&self, path: &str) -> Arc<ClientConfig> {
        let (_publisher, live) = self.pki.live(path);
        Arc::new(mtls_client_config(Arc::new(live), Arc::new(AuthorizeAny)).expect("client tls"))
    }

    /// Methods the manager has received, in order.
    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|(method, _)| method).collect()
    }

    /// Calls the manager has received, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.manager.calls.lock().expect("lock").clone()
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.scope.cancel(CancelReason::Requested);
    }
}
