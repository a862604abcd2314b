//! Scripted subsystems for bootstrap scenarios.
//!
//! Each double follows the real contract: failures discovered while starting
//! are already on the returned signal, later failures arrive on it, and a
//! cancelled scope closes it cleanly.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use forwarder_config::{Config, FailurePolicy, SocketEndpoint};
use forwarder_identity::test_support::TestPki;
use forwarder_identity::{IdentityError, IdentityPublisher, IdentitySource};

use crate::dataplane::{AGENT_SUBSYSTEM, AgentConnection, DataplaneAgent};
use crate::endpoint::{Endpoint, EndpointBuilder, EndpointError, EndpointParams};
use crate::identity::IdentityProvider;
use crate::rpc::{
    CallContext, RPC_SUBSYSTEM, RpcError, RpcServer, RpcService, RpcStatus, RpcTransport,
};
use crate::scope::Scope;
use crate::supervision::{ErrorSignal, FailureReporter, SubsystemHandle, error_signal};

use super::fakes::TRUST_DOMAIN;

/// Configuration that passes validation and logs nothing.
pub fn quiet_config(policy: FailurePolicy) -> Config {
    Config {
        log_filter: "off".to_owned(),
        failure_policy: policy,
        ..Config::default()
    }
}

/// Closes `reporter` once `scope` is cancelled and `delay` has passed.
fn close_on_cancel(scope: &Scope, reporter: FailureReporter, delay: Duration, stopped: Arc<AtomicBool>) {
    let watched = scope.clone();
    scope.spawn(async move {
        watched.cancelled().await;
        tokio::time::sleep(delay).await;
        stopped.store(true, Ordering::SeqCst);
        reporter.close();
    });
}

/// How a [`ScriptedAgent`] behaves.
#[derive(Debug, Clone, Copy)]
pub enum AgentScript {
    /// Runs until cancelled, then takes `stop_delay` to stop.
    Healthy {
        /// Time between cancellation and the signal closing.
        stop_delay: Duration,
    },
    /// Fails before `start` returns.
    FailAtStart,
}

/// Dataplane agent double.
#[derive(Debug)]
pub struct ScriptedAgent {
    script: AgentScript,
    starts: AtomicUsize,
    stopped: Arc<AtomicBool>,
}

impl ScriptedAgent {
    /// An agent following `script`.
    pub fn new(script: AgentScript) -> Self {
        Self {
            script,
            starts: AtomicUsize::new(0),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of `start` calls.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Whether the agent has finished stopping.
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataplaneAgent for ScriptedAgent {
    async fn start(&self, scope: &Scope, config: &Config) -> SubsystemHandle<AgentConnection> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (reporter, errors) = error_signal(AGENT_SUBSYSTEM);
        match self.script {
            AgentScript::Healthy { stop_delay } => {
                close_on_cancel(scope, reporter, stop_delay, Arc::clone(&self.stopped));
            }
            AgentScript::FailAtStart => {
                self.stopped.store(true, Ordering::SeqCst);
                reporter.fail(io::Error::other("agent binary refused to start"));
            }
        }
        SubsystemHandle::new(AgentConnection::new(config.agent_endpoint().clone()), errors)
    }
}

/// How a [`ScriptedIdentity`] behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityScript {
    /// Hands out an SVID from a test CA.
    Valid,
    /// Fails to obtain anything.
    Unavailable,
}

/// Identity provider double backed by [`TestPki`].
pub struct ScriptedIdentity {
    script: IdentityScript,
    pki: TestPki,
    publishers: Mutex<Vec<IdentityPublisher>>,
}

impl ScriptedIdentity {
    /// A provider following `script`.
    pub fn new(script: IdentityScript) -> Self {
        Self {
            script,
            pki: TestPki::new(TRUST_DOMAIN),
            publishers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl IdentityProvider for ScriptedIdentity {
    async fn obtain(
        &self,
        _scope: &Scope,
        config: &Config,
    ) -> Result<Arc<dyn IdentitySource>, IdentityError> {
        match self.script {
            IdentityScript::Valid => {
                let (publisher, live) = self.pki.live(&format!("/{}", config.name));
                self.publishers.lock().expect("lock").push(publisher);
                Ok(Arc::new(live))
            }
            IdentityScript::Unavailable => Err(IdentityError::Read {
                path: config.identity_dir.join("svid.pem"),
                source: io::Error::from(io::ErrorKind::NotFound),
            }),
        }
    }
}

/// Endpoint builder double that records what it was given.
#[derive(Debug, Default)]
pub struct ScriptedEndpointBuilder {
    fail: bool,
    built: Mutex<Vec<String>>,
}

impl ScriptedEndpointBuilder {
    /// A builder that refuses to build.
    pub fn failing() -> Self {
        Self {
            fail: true,
            built: Mutex::new(Vec::new()),
        }
    }

    /// Names of the endpoints built so far.
    pub fn built(&self) -> Vec<String> {
        self.built.lock().expect("lock").clone()
    }
}

struct StubEndpoint {
    name: String,
}

struct StubService;

#[async_trait]
impl RpcService for StubService {
    fn name(&self) -> &str {
        "test.Stub"
    }

    async fn call(
        &self,
        _context: &CallContext,
        _method: &str,
        payload: Value,
    ) -> Result<Value, RpcStatus> {
        Ok(payload)
    }
}

impl Endpoint for StubEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, server: &mut RpcServer) {
        server.register(Arc::new(StubService));
    }
}

#[async_trait]
impl EndpointBuilder for ScriptedEndpointBuilder {
    async fn build(
        &self,
        _scope: &Scope,
        params: EndpointParams,
    ) -> Result<Arc<dyn Endpoint>, EndpointError> {
        if self.fail {
            return Err(EndpointError::Upstream {
                source: RpcError::ServerName {
                    name: "not a host".to_owned(),
                },
            });
        }
        self.built.lock().expect("lock").push(params.name.clone());
        Ok(Arc::new(StubEndpoint { name: params.name }))
    }
}

/// How a [`ScriptedTransport`] behaves.
#[derive(Debug, Clone, Copy)]
pub enum TransportScript {
    /// Serves until cancelled.
    Healthy,
    /// Fails to bind.
    FailAtStart,
    /// Serves, then fails after the delay.
    FailAfter(Duration),
}

/// RPC transport double.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: TransportScript,
    served: Mutex<Vec<(SocketEndpoint, Vec<String>)>>,
}

impl ScriptedTransport {
    /// A transport following `script`.
    pub fn new(script: TransportScript) -> Self {
        Self {
            script,
            served: Mutex::new(Vec::new()),
        }
    }

    /// Endpoints served so far, with the services registered on each.
    pub fn served(&self) -> Vec<(SocketEndpoint, Vec<String>)> {
        self.served.lock().expect("lock").clone()
    }
}

impl RpcTransport for ScriptedTransport {
    fn listen_and_serve(
        &self,
        scope: &Scope,
        endpoint: &SocketEndpoint,
        server: RpcServer,
    ) -> ErrorSignal {
        let services = server.services().map(str::to_owned).collect();
        self.served
            .lock()
            .expect("lock")
            .push((endpoint.clone(), services));
        let (reporter, errors) = error_signal(RPC_SUBSYSTEM);
        match self.script {
            TransportScript::Healthy => {
                close_on_cancel(scope, reporter, Duration::ZERO, Arc::new(AtomicBool::new(false)));
            }
            TransportScript::FailAtStart => {
                reporter.fail(io::Error::from(io::ErrorKind::AddrInUse));
            }
            TransportScript::FailAfter(delay) => {
                let watched = scope.clone();
                scope.spawn(async move {
                    tokio::select! {
                        () = watched.cancelled() => reporter.close(),
                        () = tokio::time::sleep(delay) => {
                            reporter.fail(io::Error::from(io::ErrorKind::ConnectionAborted));
                        }
                    }
                });
            }
        }
        errors
    }
}
