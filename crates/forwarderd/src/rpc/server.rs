//! The RPC server and its accept loop.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tracing::{debug, info, warn};

use forwarder_config::SocketEndpoint;
use forwarder_identity::{SpiffeId, peer_spiffe_id};

use crate::scope::Scope;
use crate::supervision::{ErrorSignal, FailureReporter, error_signal};
use crate::transport::{IoStream, SocketListener, read_frame, write_frame};

use super::{RPC_TARGET, RpcError, RpcRequest, RpcResponse, RpcStatus};

/// Name the server reports failures under.
pub const RPC_SUBSYSTEM: &str = "rpc-server";

/// Time a client has to complete the TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// What a handler knows about the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    /// SPIFFE ID from the caller's verified certificate.
    pub peer: Option<SpiffeId>,
}

/// A named group of methods served over RPC.
#[async_trait]
pub trait RpcService: Send + Sync {
    /// Name clients address the service by.
    fn name(&self) -> &str;

    /// Handles `method` with `payload`.
    async fn call(
        &self,
        context: &CallContext,
        method: &str,
        payload: Value,
    ) -> Result<Value, RpcStatus>;
}

/// An RPC server: TLS credentials plus the registered services.
///
/// Services are registered before the server starts accepting; the set is
/// fixed once [`listen_and_serve`] takes ownership.
pub struct RpcServer {
    tls: Arc<ServerConfig>,
    services: BTreeMap<String, Arc<dyn RpcService>>,
}

impl RpcServer {
    /// Creates a server presenting the given credentials.
    #[must_use]
    pub fn new(tls: Arc<ServerConfig>) -> Self {
        Self {
            tls,
            services: BTreeMap::new(),
        }
    }

    /// Registers `service`, replacing any service with the same name.
    pub fn register(&mut self, service: Arc<dyn RpcService>) {
        let name = service.name().to_owned();
        if self.services.insert(name.clone(), service).is_some() {
            warn!(target: RPC_TARGET, service = %name, "replacing registered service");
        }
    }

    /// Names of the registered services.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Routes `request` to its service.
    pub async fn dispatch(&self, context: &CallContext, request: RpcRequest) -> RpcResponse {
        let Some(service) = self.services.get(&request.service) else {
            return RpcResponse::from(Err(RpcStatus::not_found(format!(
                "unknown service '{}'",
                request.service
            ))));
        };
        debug!(
            target: RPC_TARGET,
            service = %request.service,
            method = %request.method,
            peer = ?context.peer.as_ref().map(ToString::to_string),
            "dispatching call"
        );
        RpcResponse::from(
            service
                .call(context, &request.method, request.payload)
                .await,
        )
    }
}

/// Starts serving RPC connections.
pub trait RpcTransport: Send + Sync {
    /// Binds `endpoint` and serves `server` until `scope` is cancelled.
    ///
    /// Bind failures are reported through the returned signal before it is
    /// handed back. The signal closes once the listener has stopped.
    fn listen_and_serve(
        &self,
        scope: &Scope,
        endpoint: &SocketEndpoint,
        server: RpcServer,
    ) -> ErrorSignal;
}

/// Serves over TCP or Unix sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketTransport;

impl RpcTransport for SocketTransport {
    fn listen_and_serve(
        &self,
        scope: &Scope,
        endpoint: &SocketEndpoint,
        server: RpcServer,
    ) -> ErrorSignal {
        listen_and_serve(scope, endpoint, server)
    }
}

/// Binds `endpoint` and serves `server` on a background task.
///
/// Must be called from within a Tokio runtime.
pub fn listen_and_serve(scope: &Scope, endpoint: &SocketEndpoint, server: RpcServer) -> ErrorSignal {
    let (reporter, errors) = error_signal(RPC_SUBSYSTEM);
    if let Err(source) = endpoint.prepare_filesystem() {
        reporter.fail(RpcError::Prepare { source });
        return errors;
    }
    let listener = match SocketListener::bind(endpoint) {
        Ok(listener) => listener,
        Err(source) => {
            reporter.fail(RpcError::Listen { source });
            return errors;
        }
    };
    scope.spawn(serve(listener, Arc::new(server), scope.clone(), reporter));
    errors
}

async fn serve(
    listener: SocketListener,
    server: Arc<RpcServer>,
    scope: Scope,
    reporter: FailureReporter,
) {
    let acceptor = TlsAcceptor::from(Arc::clone(&server.tls));
    info!(
        target: RPC_TARGET,
        endpoint = %listener.endpoint(),
        services = ?server.services().collect::<Vec<_>>(),
        "RPC server listening"
    );
    let mut connections = JoinSet::new();
    let mut last_error = None::<io::ErrorKind>;
    let fatal = loop {
        tokio::select! {
            biased;
            () = scope.cancelled() => break None,
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    last_error = None;
                    let connection = handle_connection(
                        acceptor.clone(),
                        stream,
                        Arc::clone(&server),
                        scope.clone(),
                    );
                    connections.spawn(scope.bind(connection));
                }
                Err(error) if is_transient(&error) => {
                    if last_error != Some(error.kind()) {
                        warn!(target: RPC_TARGET, error = %error, "socket accept error");
                    }
                    last_error = Some(error.kind());
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
                Err(error) => break Some(error),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };
    drop(listener);
    connections.shutdown().await;
    match fatal {
        Some(source) => reporter.fail(RpcError::Accept { source }),
        None => {
            info!(target: RPC_TARGET, "RPC server stopped");
            reporter.close();
        }
    }
}

fn is_transient(error: &io::Error) -> bool {
    if matches!(
        error.raw_os_error(),
        Some(code) if code == nix::errno::Errno::EMFILE as i32
            || code == nix::errno::Errno::ENFILE as i32
            || code == nix::errno::Errno::ENOBUFS as i32
            || code == nix::errno::Errno::ENOMEM as i32
    ) {
        return true;
    }
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    stream: IoStream,
    server: Arc<RpcServer>,
    scope: Scope,
) {
    let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(error)) => {
            warn!(target: RPC_TARGET, error = %error, "TLS handshake rejected");
            return;
        }
        Err(_) => {
            warn!(target: RPC_TARGET, "TLS handshake timed out");
            return;
        }
    };
    let context = CallContext {
        peer: peer_spiffe_id(tls.get_ref().1.peer_certificates()),
    };
    let mut stream = BufReader::new(tls);
    loop {
        let frame = tokio::select! {
            biased;
            () = scope.cancelled() => break,
            frame = read_frame(&mut stream) => frame,
        };
        let response = match frame {
            Ok(Some(frame)) => match serde_json::from_slice::<RpcRequest>(&frame) {
                Ok(request) => server.dispatch(&context, request).await,
                Err(error) => RpcResponse::from(Err(RpcStatus::invalid_request(error.to_string()))),
            },
            Ok(None) => break,
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                RpcResponse::from(Err(RpcStatus::invalid_request(error.to_string())))
            }
            Err(error) => {
                debug!(target: RPC_TARGET, error = %error, "connection closed");
                break;
            }
        };
        let close_after = matches!(
            &response,
            RpcResponse::Error { code: super::RpcCode::InvalidRequest, .. }
        );
        if let Err(error) = write_frame(stream.get_mut(), &response).await {
            debug!(target: RPC_TARGET, error = %error, "failed to write response");
            break;
        }
        if close_after {
            break;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use camino::Utf8PathBuf;
    use rstest::{fixture, rstest};
    use serde_json::json;
    use tempfile::TempDir;

    use forwarder_identity::test_support::TestPki;
    use forwarder_identity::{AuthorizeAny, mtls_client_config, mtls_server_config};

    use crate::rpc::{RpcClient, RpcCode};
    use crate::scope::CancelReason;
    use crate::telemetry::TelemetryHandle;

    use super::*;

    struct Echo;

    #[async_trait]
    impl RpcService for Echo {
        fn name(&self) -> &str {
            "test.Echo"
        }

        async fn call(
            &self,
            context: &CallContext,
            method: &str,
            payload: Value,
        ) -> Result<Value, RpcStatus> {
            match method {
                "Echo" => Ok(json!({
                    "payload": payload,
                    "peer": context.peer.as_ref().map(ToString::to_string),
                })),
                other => Err(RpcStatus::not_found(format!("no method {other}"))),
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        endpoint: SocketEndpoint,
        pki: TestPki,
        scope: Scope,
    }

    #[fixture]
    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("rpc.sock")).expect("utf-8");
        Fixture {
            _dir: dir,
            endpoint: SocketEndpoint::unix(path),
            pki: TestPki::new("example.org"),
            scope: Scope::new(TelemetryHandle::disabled(), Instant::now(), "forwarderd", "test"),
        }
    }

    fn server(pki: &TestPki) -> RpcServer {
        let (_publisher, live) = pki.live("/forwarder");
        let tls = mtls_server_config(Arc::new(live), Arc::new(AuthorizeAny)).expect("server tls");
        let mut server = RpcServer::new(Arc::new(tls));
        server.register(Arc::new(Echo));
        server
    }

    fn client(pki: &TestPki, endpoint: &SocketEndpoint) -> RpcClient {
        let (_publisher, live) = pki.live("/nsmgr");
        let tls = mtls_client_config(Arc::new(live), Arc::new(AuthorizeAny)).expect("client tls");
        RpcClient::new(endpoint.clone(), Arc::new(tls)).expect("client")
    }

    #[rstest]
    #[tokio::test]
    async fn calls_reach_services_with_the_peer_identity(fixture: Fixture) {
        let errors = listen_and_serve(&fixture.scope, &fixture.endpoint, server(&fixture.pki));
        assert!(errors.peek().is_none());

        let reply = client(&fixture.pki, &fixture.endpoint)
            .call("test.Echo", "Echo", json!({"n": 1}))
            .await
            .expect("call succeeds");

        assert_eq!(reply["payload"], json!({"n": 1}));
        assert_eq!(reply["peer"], json!("spiffe://example.org/nsmgr"));
        fixture.scope.cancel(CancelReason::Requested);
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_services_are_not_found(fixture: Fixture) {
        let _errors = listen_and_serve(&fixture.scope, &fixture.endpoint, server(&fixture.pki));

        let error = client(&fixture.pki, &fixture.endpoint)
            .call("test.Missing", "Echo", Value::Null)
            .await
            .expect_err("no such service");

        assert_eq!(error.status().map(|status| status.code), Some(RpcCode::NotFound));
        fixture.scope.cancel(CancelReason::Requested);
    }

    #[rstest]
    #[tokio::test]
    async fn cancellation_closes_the_signal_and_removes_the_socket(fixture: Fixture) {
        let errors = listen_and_serve(&fixture.scope, &fixture.endpoint, server(&fixture.pki));

        fixture.scope.cancel(CancelReason::Signal);
        tokio::time::timeout(Duration::from_secs(5), errors.closed())
            .await
            .expect("server stops");

        assert!(errors.peek().is_none());
        let path = fixture.endpoint.unix_path().expect("unix endpoint");
        assert!(!path.exists(), "socket file should be removed");
    }

    #[rstest]
    #[tokio::test]
    async fn bind_failures_are_reported_before_returning(fixture: Fixture) {
        let path = fixture.endpoint.unix_path().expect("unix endpoint");
        let _occupant = std::os::unix::net::UnixListener::bind(path).expect("occupy socket");

        let errors = listen_and_serve(&fixture.scope, &fixture.endpoint, server(&fixture.pki));

        let failure = errors.peek().expect("bind failure visible immediately");
        assert_eq!(failure.subsystem(), RPC_SUBSYSTEM);
    }

    #[rstest]
    #[tokio::test]
    async fn peers_from_other_trust_roots_are_refused(fixture: Fixture) {
        let _errors = listen_and_serve(&fixture.scope, &fixture.endpoint, server(&fixture.pki));
        let stranger = TestPki::new("example.org");

        let error = client(&stranger, &fixture.endpoint)
            .call("test.Echo", "Echo", Value::Null)
            .await
            .expect_err("untrusted client");

        assert!(
            matches!(error, RpcError::Handshake { .. } | RpcError::Io { .. } | RpcError::NoResponse),
            "{error}"
        );
        fixture.scope.cancel(CancelReason::Requested);
    }
}
