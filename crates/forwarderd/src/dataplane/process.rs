//! Dataplane agent run as a child process.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use forwarder_config::Config;

use crate::scope::Scope;
use crate::supervision::{FailureReporter, SubsystemHandle, error_signal};

use super::{AGENT_SUBSYSTEM, AgentConnection, AgentError, DATAPLANE_TARGET, DataplaneAgent};

/// Interval between readiness probes while the agent starts.
pub const AGENT_READY_POLL: Duration = Duration::from_millis(100);

/// Grace period between `SIGTERM` and `SIGKILL` when stopping the agent.
pub const AGENT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Launches the configured agent executable.
///
/// The agent is started as `<agent_command> --config-dir <agent_config_dir>`
/// and is considered ready once its control endpoint answers a ping.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessAgent;

impl ProcessAgent {
    /// Builds the launcher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DataplaneAgent for ProcessAgent {
    async fn start(&self, scope: &Scope, config: &Config) -> SubsystemHandle<AgentConnection> {
        let (reporter, errors) = error_signal(AGENT_SUBSYSTEM);
        let connection = AgentConnection::new(config.agent_endpoint().clone());

        let mut command = Command::new(config.agent_command.as_std_path());
        command
            .arg("--config-dir")
            .arg(config.agent_config_dir.as_std_path())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                reporter.fail(AgentError::Spawn {
                    command: config.agent_command.clone(),
                    source,
                });
                return SubsystemHandle::new(connection, errors);
            }
        };
        info!(
            target: DATAPLANE_TARGET,
            command = %config.agent_command,
            pid = child.id(),
            "dataplane agent launched"
        );

        match await_ready(&mut child, &connection, scope).await {
            Readiness::Ready => {
                info!(
                    target: DATAPLANE_TARGET,
                    endpoint = %connection.endpoint(),
                    "dataplane agent ready"
                );
                scope.spawn(supervise(child, reporter, scope.clone()));
            }
            Readiness::Exited(status) => {
                reporter.fail(AgentError::ExitedDuringStartup { status });
            }
            Readiness::WaitFailed(source) => {
                reporter.fail(AgentError::Wait { source });
            }
            Readiness::Cancelled => {
                stop(&mut child).await;
                reporter.close();
            }
        }
        SubsystemHandle::new(connection, errors)
    }
}

enum Readiness {
    Ready,
    Exited(std::process::ExitStatus),
    WaitFailed(std::io::Error),
    Cancelled,
}

async fn await_ready(child: &mut Child, connection: &AgentConnection, scope: &Scope) -> Readiness {
    loop {
        tokio::select! {
            biased;
            () = scope.cancelled() => return Readiness::Cancelled,
            status = child.wait() => return match status {
                Ok(status) => Readiness::Exited(status),
                Err(error) => Readiness::WaitFailed(error),
            },
            () = tokio::time::sleep(AGENT_READY_POLL) => {
                match connection.ping().await {
                    Ok(()) => return Readiness::Ready,
                    Err(error) => {
                        debug!(target: DATAPLANE_TARGET, error = %error, "dataplane agent not ready");
                    }
                }
            }
        }
    }
}

async fn supervise(mut child: Child, reporter: FailureReporter, scope: Scope) {
    tokio::select! {
        biased;
        () = scope.cancelled() => {
            stop(&mut child).await;
            reporter.close();
        }
        status = child.wait() => {
            if scope.is_cancelled() {
                reporter.close();
                return;
            }
            match status {
                Ok(status) => reporter.fail(AgentError::Exited { status }),
                Err(source) => reporter.fail(AgentError::Wait { source }),
            }
        }
    }
}

/// Asks the agent to terminate and kills it if it lingers.
async fn stop(child: &mut Child) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        if let Err(error) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!(target: DATAPLANE_TARGET, error = %error, "failed to signal dataplane agent");
        }
    }
    match tokio::time::timeout(AGENT_STOP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => {
            info!(target: DATAPLANE_TARGET, %status, "dataplane agent stopped");
        }
        Ok(Err(error)) => {
            warn!(target: DATAPLANE_TARGET, error = %error, "failed to reap dataplane agent");
        }
        Err(_) => {
            warn!(
                target: DATAPLANE_TARGET,
                timeout_secs = AGENT_STOP_TIMEOUT.as_secs(),
                "dataplane agent ignored SIGTERM; killing it"
            );
            if let Err(error) = child.kill().await {
                warn!(target: DATAPLANE_TARGET, error = %error, "failed to kill dataplane agent");
            }
        }
    }
}
