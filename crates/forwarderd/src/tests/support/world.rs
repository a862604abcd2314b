//! BDD test world: the collaborators, the runtime they run on, and the
//! outcome of bootstrap and shutdown.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;

use forwarder_config::{Config, FailurePolicy};
use forwarder_identity::AuthorizeAny;

use crate::bootstrap::{
    BootstrapError, Collaborators, Forwarder, ShutdownReport, StaticConfigLoader, bootstrap_with,
};
use crate::shutdown::ManualShutdown;

use super::collaborators::{
    AgentScript, IdentityScript, ScriptedAgent, ScriptedEndpointBuilder, ScriptedIdentity,
    ScriptedTransport, TransportScript, quiet_config,
};
use super::reporter::RecordingHealthReporter;

/// Upper bound on any single scenario step.
const STEP_TIMEOUT: Duration = Duration::from_secs(20);

/// Scenario world shared across BDD steps.
pub struct TestWorld {
    runtime: Runtime,
    pub config: Config,
    pub reporter: Arc<RecordingHealthReporter>,
    pub agent: Arc<ScriptedAgent>,
    pub identity: Arc<ScriptedIdentity>,
    pub endpoint: Arc<ScriptedEndpointBuilder>,
    pub transport: Arc<ScriptedTransport>,
    pub shutdown: ManualShutdown,
    forwarder: Option<Forwarder>,
    bootstrap_error: Option<BootstrapError>,
    report: Option<ShutdownReport>,
}

impl TestWorld {
    /// Builds a world in which every collaborator succeeds.
    #[must_use]
    pub fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("test runtime");
        Self {
            runtime,
            config: quiet_config(FailurePolicy::Cancel),
            reporter: Arc::new(RecordingHealthReporter::default()),
            agent: Arc::new(ScriptedAgent::new(AgentScript::Healthy {
                stop_delay: Duration::ZERO,
            })),
            identity: Arc::new(ScriptedIdentity::new(IdentityScript::Valid)),
            endpoint: Arc::new(ScriptedEndpointBuilder::default()),
            transport: Arc::new(ScriptedTransport::new(TransportScript::Healthy)),
            shutdown: ManualShutdown::new(),
            forwarder: None,
            bootstrap_error: None,
            report: None,
        }
    }

    /// Replaces the dataplane agent.
    pub fn use_agent(&mut self, script: AgentScript) {
        self.agent = Arc::new(ScriptedAgent::new(script));
    }

    /// Replaces the identity provider.
    pub fn use_identity(&mut self, script: IdentityScript) {
        self.identity = Arc::new(ScriptedIdentity::new(script));
    }

    /// Replaces the endpoint builder with one that fails.
    pub fn use_failing_endpoint(&mut self) {
        self.endpoint = Arc::new(ScriptedEndpointBuilder::failing());
    }

    /// Replaces the RPC transport.
    pub fn use_transport(&mut self, script: TransportScript) {
        self.transport = Arc::new(ScriptedTransport::new(script));
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            agent: self.agent.clone(),
            identity: self.identity.clone(),
            endpoint: self.endpoint.clone(),
            transport: self.transport.clone(),
            peer_authorizer: Arc::new(AuthorizeAny),
            request_authorizer: Arc::new(AuthorizeAny),
            shutdown: Arc::new(self.shutdown.clone()),
        }
    }

    /// Runs the bootstrap sequence once.
    pub fn start(&mut self) {
        if self.forwarder.is_some() || self.bootstrap_error.is_some() {
            return;
        }
        let loader = StaticConfigLoader::new(self.config.clone());
        let reporter = self.reporter.clone();
        let collaborators = self.collaborators();
        let outcome = self.runtime.block_on(async {
            tokio::time::timeout(STEP_TIMEOUT, bootstrap_with(&loader, reporter, collaborators))
                .await
                .expect("bootstrap finished in time")
        });
        match outcome {
            Ok(forwarder) => self.forwarder = Some(forwarder),
            Err(error) => self.bootstrap_error = Some(error),
        }
    }

    /// Delivers a termination signal.
    pub fn signal(&self) {
        self.shutdown.trigger();
    }

    /// Waits for the started forwarder to shut down.
    pub fn run_until_shutdown(&mut self) {
        let Some(forwarder) = self.forwarder.take() else {
            return;
        };
        let report = self.runtime.block_on(async {
            tokio::time::timeout(STEP_TIMEOUT, forwarder.run_until_shutdown())
                .await
                .expect("shutdown finished in time")
        });
        self.report = Some(report);
    }

    /// Returns the bootstrap error, if any.
    #[must_use]
    pub fn bootstrap_error(&self) -> Option<&BootstrapError> {
        self.bootstrap_error.as_ref()
    }

    /// Returns the shutdown report once the forwarder has stopped.
    #[must_use]
    pub fn report(&self) -> Option<&ShutdownReport> {
        self.report.as_ref()
    }

    /// Whether the process would exit with a failure status.
    #[must_use]
    pub fn exit_failed(&self) -> Option<bool> {
        if self.bootstrap_error.is_some() {
            return Some(true);
        }
        self.report
            .as_ref()
            .map(|report| report.is_fatal(self.config.failure_policy()))
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Default test world fixture.
#[must_use]
pub fn world() -> RefCell<TestWorld> {
    RefCell::new(TestWorld::new())
}
