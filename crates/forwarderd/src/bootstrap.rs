//! Forwarder bootstrap orchestration.
//!
//! Startup runs five phases strictly in order. Each phase starts only after
//! the previous one produced its resource, and any phase error ends bootstrap
//! without a retry. Subsystems that keep running (the dataplane agent and the
//! RPC server) hand their error signals to the [`Supervisor`], which turns a
//! later failure into a cancellation of the shared [`Scope`].

use std::env;
use std::fmt;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ortho_config::{OrthoConfig, OrthoError};
use strum::Display;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use forwarder_config::{Config, ConfigValidationError, FailurePolicy};
use forwarder_identity::{
    AuthorizeAny, Authorizer, IdentityError, IdentitySource, JwtTokenGenerator, TlsError,
    mtls_client_config, mtls_server_config,
};
use tokio_rustls::rustls::{ClientConfig, ServerConfig};

use crate::dataplane::{AGENT_STOP_TIMEOUT, AgentConnection, DataplaneAgent, ProcessAgent};
use crate::endpoint::{
    AgentTunnelInit, Endpoint, EndpointBuilder, EndpointError, EndpointParams, XconnectBuilder,
};
use crate::health::HealthReporter;
use crate::identity::{FileIdentityProvider, IdentityProvider};
use crate::rpc::{RpcServer, RpcTransport, SocketTransport};
use crate::scope::{CancelReason, Scope};
use crate::shutdown::{ShutdownSignal, SystemShutdownSignal};
use crate::supervision::{ErrorSignal, SubsystemFailure, SubsystemHandle, Supervisor};
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

const BOOTSTRAP_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::bootstrap");

/// How long shutdown waits for the agent before warning that it is still
/// waiting.
const AGENT_SHUTDOWN_WARNING: Duration = AGENT_STOP_TIMEOUT.saturating_add(Duration::from_secs(5));

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the forwarder configuration.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that reads `NSM_*` environment variables and configuration files.
///
/// Command-line arguments are ignored apart from the program name.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load_from_iter(env::args_os().take(1))
    }
}

/// Loader that returns a pre-resolved configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps an already loaded configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// The bootstrap phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    /// Load and validate configuration, then build telemetry.
    Configuration,
    /// Start the dataplane agent.
    Dataplane,
    /// Obtain the SVID and derive mTLS credentials.
    Identity,
    /// Build the network service endpoint chain.
    Endpoint,
    /// Start the RPC server.
    Server,
}

impl Phase {
    /// Every phase in execution order.
    pub const ALL: [Self; 5] = [
        Self::Configuration,
        Self::Dataplane,
        Self::Identity,
        Self::Endpoint,
        Self::Server,
    ];

    /// One-based position of the phase.
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Configuration => 1,
            Self::Dataplane => 2,
            Self::Identity => 3,
            Self::Endpoint => 4,
            Self::Server => 5,
        }
    }

    /// What the phase does, for log lines.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Configuration => "get config from environment",
            Self::Dataplane => "start the dataplane agent",
            Self::Identity => "retrieve spiffe svid",
            Self::Endpoint => "create the network service endpoint",
            Self::Server => "create grpc server and register the endpoint",
        }
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Configuration loaded but is inconsistent.
    #[error("invalid configuration: {source}")]
    InvalidConfiguration {
        /// Violated invariant.
        #[source]
        source: ConfigValidationError,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The dataplane agent could not start.
    #[error("failed to start the dataplane agent: {source}")]
    Dataplane {
        /// Failure reported on the agent's error signal.
        #[source]
        source: SubsystemFailure,
    },
    /// No usable SVID was obtained.
    #[error("failed to obtain an SVID: {source}")]
    Identity {
        /// Identity error.
        #[source]
        source: IdentityError,
    },
    /// mTLS credentials could not be derived from the SVID.
    #[error("failed to build TLS credentials: {source}")]
    Credentials {
        /// TLS error.
        #[source]
        source: TlsError,
    },
    /// The endpoint chain could not be built.
    #[error("failed to build the endpoint: {source}")]
    Endpoint {
        /// Endpoint error.
        #[source]
        source: EndpointError,
    },
    /// The RPC server could not start.
    #[error("failed to start the RPC server: {source}")]
    Server {
        /// Failure reported on the server's error signal.
        #[source]
        source: SubsystemFailure,
    },
}

impl BootstrapError {
    /// Phase the error ended.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::Configuration { .. }
            | Self::InvalidConfiguration { .. }
            | Self::Telemetry { .. } => Phase::Configuration,
            Self::Dataplane { .. } => Phase::Dataplane,
            Self::Identity { .. } | Self::Credentials { .. } => Phase::Identity,
            Self::Endpoint { .. } => Phase::Endpoint,
            Self::Server { .. } => Phase::Server,
        }
    }
}

/// Subsystem implementations the bootstrap wires together.
pub struct Collaborators {
    /// Starts the dataplane agent (phase 2).
    pub agent: Arc<dyn DataplaneAgent>,
    /// Supplies the live identity (phase 3).
    pub identity: Arc<dyn IdentityProvider>,
    /// Builds the endpoint chain (phase 4).
    pub endpoint: Arc<dyn EndpointBuilder>,
    /// Serves the RPC server (phase 5).
    pub transport: Arc<dyn RpcTransport>,
    /// Checks peers during mTLS handshakes, in both directions.
    pub peer_authorizer: Arc<dyn Authorizer>,
    /// Checks callers of the endpoint's methods.
    pub request_authorizer: Arc<dyn Authorizer>,
    /// Requests shutdown from outside the process.
    pub shutdown: Arc<dyn ShutdownSignal>,
}

impl Collaborators {
    /// Production wiring: a child-process agent, file-backed identity, the
    /// cross-connect endpoint, socket transport, OS signals and accept-any
    /// authorization.
    #[must_use]
    pub fn production() -> Self {
        Self {
            agent: Arc::new(ProcessAgent::new()),
            identity: Arc::new(FileIdentityProvider),
            endpoint: Arc::new(XconnectBuilder),
            transport: Arc::new(SocketTransport),
            peer_authorizer: Arc::new(AuthorizeAny),
            request_authorizer: Arc::new(AuthorizeAny),
            shutdown: Arc::new(SystemShutdownSignal),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Collaborators")
            .field("peer_authorizer", &self.peer_authorizer)
            .field("request_authorizer", &self.request_authorizer)
            .finish_non_exhaustive()
    }
}

/// How a started forwarder ended.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    reason: CancelReason,
    failures: Vec<SubsystemFailure>,
    elapsed: Duration,
}

impl ShutdownReport {
    /// Why the scope was cancelled.
    #[must_use]
    pub fn reason(&self) -> &CancelReason {
        &self.reason
    }

    /// Failures reported by running subsystems.
    #[must_use]
    pub fn failures(&self) -> &[SubsystemFailure] {
        &self.failures
    }

    /// Time from bootstrap start to the end of shutdown.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Whether every subsystem stopped without failing.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether the outcome should fail the process under `policy`.
    #[must_use]
    pub fn is_fatal(&self, policy: FailurePolicy) -> bool {
        policy.is_fatal() && !self.is_success()
    }

    /// Process exit status under `policy`.
    #[must_use]
    pub fn exit_code(&self, policy: FailurePolicy) -> ExitCode {
        if self.is_fatal(policy) {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        }
    }
}

/// A forwarder whose five phases have all completed.
pub struct Forwarder {
    config: Config,
    scope: Scope,
    reporter: Arc<dyn HealthReporter>,
    supervisor: Supervisor,
    agent_errors: ErrorSignal,
    endpoint: Arc<dyn Endpoint>,
    signals: JoinHandle<()>,
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Forwarder")
            .field("name", &self.config.name)
            .field("scope", &self.scope)
            .field("endpoint", &self.endpoint.name())
            .finish_non_exhaustive()
    }
}

impl Forwarder {
    /// Accessor for the resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The scope every subsystem runs in.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The served endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &dyn Endpoint {
        &*self.endpoint
    }

    /// Asks the forwarder to stop as if a termination signal had arrived.
    pub fn shutdown(&self) {
        self.scope.cancel(CancelReason::Requested);
    }

    /// Blocks until the scope is cancelled, then waits for the dataplane
    /// agent to finish shutting down.
    ///
    /// The RPC server stops as a consequence of the cancellation; only the
    /// agent is awaited explicitly.
    pub async fn run_until_shutdown(self) -> ShutdownReport {
        let Self {
            scope,
            reporter,
            supervisor,
            agent_errors,
            signals,
            ..
        } = self;
        let bound = scope.clone();
        bound
            .bind(async move {
                scope.cancelled().await;
                let reason = scope.reason().cloned().unwrap_or(CancelReason::Requested);
                reporter.shutdown_requested(&reason, scope.elapsed());

                await_agent(&agent_errors).await;
                let failures = supervisor.drain().await;
                if let Err(error) = signals.await {
                    debug!(target: BOOTSTRAP_TARGET, error = %error, "signal watcher ended abnormally");
                }

                let report = ShutdownReport {
                    reason,
                    failures,
                    elapsed: scope.elapsed(),
                };
                reporter.shutdown_completed(&report, report.elapsed);
                report
            })
            .await
    }
}

/// Waits for the agent's signal to close, warning if it takes unusually long.
async fn await_agent(agent_errors: &ErrorSignal) {
    if tokio::time::timeout(AGENT_SHUTDOWN_WARNING, agent_errors.closed())
        .await
        .is_ok()
    {
        return;
    }
    warn!(
        target: BOOTSTRAP_TARGET,
        waited_secs = AGENT_SHUTDOWN_WARNING.as_secs(),
        "still waiting for the dataplane agent to stop"
    );
    agent_errors.closed().await;
}

/// Bootstraps the forwarder using the supplied collaborators.
///
/// Phase 1 logs through a compact stderr subscriber because the configured
/// one does not exist yet. From phase 2 onwards everything logs through the
/// scope.
pub async fn bootstrap_with(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
    collaborators: Collaborators,
) -> Result<Forwarder, BootstrapError> {
    let started = Instant::now();
    let early = TelemetryHandle::early();
    let (config, telemetry) = tracing::dispatcher::with_default(early.dispatch(), || {
        reporter.bootstrap_starting();
        reporter.phase_starting(Phase::Configuration, started.elapsed());
        match load_configuration(loader) {
            Ok(loaded) => {
                reporter.phase_completed(Phase::Configuration, started.elapsed());
                Ok(loaded)
            }
            Err(error) => {
                reporter.startup_failed(&error, started.elapsed());
                Err(error)
            }
        }
    })?;

    let scope = Scope::new(telemetry, started, &command_name(), config.name());
    let startup = Startup {
        signals: scope.arm_signals(Arc::clone(&collaborators.shutdown)),
        supervisor: Supervisor::new(scope.clone(), Arc::clone(&reporter)),
        scope: scope.clone(),
        config,
        reporter,
        collaborators,
        agent_errors: None,
    };
    scope.bind(startup.run()).await
}

fn load_configuration(loader: &dyn ConfigLoader) -> Result<(Config, TelemetryHandle), BootstrapError> {
    let config = loader
        .load()
        .map_err(|source| BootstrapError::Configuration { source })?;
    config
        .validate()
        .map_err(|source| BootstrapError::InvalidConfiguration { source })?;
    let telemetry =
        telemetry::initialise(&config).map_err(|source| BootstrapError::Telemetry { source })?;
    info!(
        target: BOOTSTRAP_TARGET,
        name = %config.name,
        listen_on = %config.listen_on,
        connect_to = %config.connect_to,
        failure_policy = %config.failure_policy,
        "configuration loaded"
    );
    Ok((config, telemetry))
}

fn command_name() -> String {
    env::args_os()
        .next()
        .map(|arg| arg.to_string_lossy().into_owned())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned())
}

/// State carried through phases 2 to 5.
struct Startup {
    scope: Scope,
    config: Config,
    reporter: Arc<dyn HealthReporter>,
    collaborators: Collaborators,
    supervisor: Supervisor,
    agent_errors: Option<ErrorSignal>,
    signals: JoinHandle<()>,
}

/// Credentials derived from the live identity in phase 3.
struct Credentials {
    source: Arc<dyn IdentitySource>,
    client: ClientConfig,
    server: ServerConfig,
}

/// What phases 2 to 5 leave running.
struct Running {
    agent_errors: ErrorSignal,
    endpoint: Arc<dyn Endpoint>,
}

impl Startup {
    async fn run(mut self) -> Result<Forwarder, BootstrapError> {
        match self.start_subsystems().await {
            Ok(running) => Ok(self.finish(running)),
            Err(error) => Err(self.abort(error).await),
        }
    }

    async fn start_subsystems(&mut self) -> Result<Running, BootstrapError> {
        self.begin(Phase::Dataplane);
        let (agent, agent_errors) = self.start_agent().await?;
        self.complete(Phase::Dataplane);

        self.begin(Phase::Identity);
        let credentials = self.obtain_credentials().await?;
        self.complete(Phase::Identity);

        self.begin(Phase::Endpoint);
        let endpoint = self.build_endpoint(agent, &credentials).await?;
        self.complete(Phase::Endpoint);

        self.begin(Phase::Server);
        self.start_server(&*endpoint, credentials.server)?;
        self.complete(Phase::Server);
        Ok(Running {
            agent_errors,
            endpoint,
        })
    }

    fn begin(&self, phase: Phase) {
        self.reporter.phase_starting(phase, self.scope.elapsed());
    }

    fn complete(&self, phase: Phase) {
        self.reporter.phase_completed(phase, self.scope.elapsed());
    }

    async fn start_agent(&mut self) -> Result<(AgentConnection, ErrorSignal), BootstrapError> {
        let SubsystemHandle { resource, errors } = self
            .collaborators
            .agent
            .start(&self.scope, &self.config)
            .await;
        self.agent_errors = Some(errors.clone());
        self.supervisor
            .watch(errors.clone())
            .map_err(|source| BootstrapError::Dataplane { source })?;
        Ok((resource, errors))
    }

    async fn obtain_credentials(&self) -> Result<Credentials, BootstrapError> {
        let source = self
            .collaborators
            .identity
            .obtain(&self.scope, &self.config)
            .await
            .map_err(|source| BootstrapError::Identity { source })?;
        let svid = source
            .current_svid()
            .map_err(|source| BootstrapError::Identity { source })?;
        info!(
            target: BOOTSTRAP_TARGET,
            spiffe_id = %svid.spiffe_id(),
            expires_at = ?svid.expires_at(),
            "SVID obtained"
        );
        let authorizer = &self.collaborators.peer_authorizer;
        let client = mtls_client_config(Arc::clone(&source), Arc::clone(authorizer))
            .map_err(|source| BootstrapError::Credentials { source })?;
        let server = mtls_server_config(Arc::clone(&source), Arc::clone(authorizer))
            .map_err(|source| BootstrapError::Credentials { source })?;
        Ok(Credentials {
            source,
            client,
            server,
        })
    }

    async fn build_endpoint(
        &self,
        agent: AgentConnection,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Endpoint>, BootstrapError> {
        let tokens = JwtTokenGenerator::new(
            Arc::clone(&credentials.source),
            self.config.max_token_lifetime.get(),
        );
        let params = EndpointParams {
            name: self.config.name.clone(),
            authorizer: Arc::clone(&self.collaborators.request_authorizer),
            tokens: Arc::new(tokens),
            agent,
            base_dir: self.config.base_dir.clone(),
            tunnel_init: Arc::new(AgentTunnelInit::new(self.config.tunnel_ip)),
            connect_to: self.config.connect_to.clone(),
            client_tls: Arc::new(credentials.client.clone()),
        };
        self.collaborators
            .endpoint
            .build(&self.scope, params)
            .await
            .map_err(|source| BootstrapError::Endpoint { source })
    }

    fn start_server(&mut self, endpoint: &dyn Endpoint, tls: ServerConfig) -> Result<(), BootstrapError> {
        let mut server = RpcServer::new(Arc::new(tls));
        endpoint.register(&mut server);
        let errors = self.collaborators.transport.listen_and_serve(
            &self.scope,
            self.config.listen_on(),
            server,
        );
        self.supervisor
            .watch(errors)
            .map_err(|source| BootstrapError::Server { source })?;
        info!(
            target: BOOTSTRAP_TARGET,
            listen_on = %self.config.listen_on,
            endpoint = endpoint.name(),
            "RPC server listening"
        );
        Ok(())
    }

    /// Hands the running subsystems over to a [`Forwarder`].
    ///
    /// A scope cancelled while the phases ran is not reported as a completed
    /// startup; the returned forwarder drains as soon as it is run.
    fn finish(self, running: Running) -> Forwarder {
        if self.scope.is_cancelled() {
            info!(
                target: BOOTSTRAP_TARGET,
                reason = ?self.scope.reason(),
                "forwarder cancelled during startup; draining"
            );
        } else {
            self.reporter.startup_completed(self.scope.elapsed());
        }
        Forwarder {
            config: self.config,
            scope: self.scope,
            reporter: self.reporter,
            supervisor: self.supervisor,
            agent_errors: running.agent_errors,
            endpoint: running.endpoint,
            signals: self.signals,
        }
    }

    /// Reports `error`, cancels the scope and waits for anything already
    /// started to stop.
    async fn abort(self, error: BootstrapError) -> BootstrapError {
        self.reporter.startup_failed(&error, self.scope.elapsed());
        self.scope.cancel(CancelReason::StartupAborted);
        if let Some(agent_errors) = &self.agent_errors {
            await_agent(agent_errors).await;
        }
        self.supervisor.drain().await;
        self.signals.abort();
        error
    }
}
