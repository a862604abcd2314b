//! Background monitors over subsystem error signals.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::health::HealthReporter;
use crate::scope::{CancelReason, Scope};

use super::{ErrorSignal, SUPERVISION_TARGET, SubsystemFailure};

/// How long [`Supervisor::drain`] waits for subsystems to close their signals.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Watches subsystem error signals and cancels the scope on failure.
pub struct Supervisor {
    scope: Scope,
    reporter: Arc<dyn HealthReporter>,
    monitors: JoinSet<Option<SubsystemFailure>>,
}

impl Supervisor {
    /// Creates a supervisor that cancels `scope` and reports through
    /// `reporter`.
    #[must_use]
    pub fn new(scope: Scope, reporter: Arc<dyn HealthReporter>) -> Self {
        Self {
            scope,
            reporter,
            monitors: JoinSet::new(),
        }
    }

    /// Registers `signal`.
    ///
    /// A failure that is already waiting on the signal is returned to the
    /// caller instead of being monitored, so a subsystem that could not start
    /// fails bootstrap outright. Otherwise a monitor task is spawned that logs
    /// the eventual failure and cancels the scope. The monitor ends when the
    /// signal resolves; a subsystem that never fails therefore never cancels
    /// the scope.
    pub fn watch(&mut self, signal: ErrorSignal) -> Result<(), SubsystemFailure> {
        if let Some(failure) = signal.peek() {
            return Err(failure);
        }
        let scope = self.scope.clone();
        let reporter = Arc::clone(&self.reporter);
        let monitor = async move {
            let failure = signal.wait().await?;
            reporter.subsystem_failed(&failure, scope.elapsed());
            scope.cancel(CancelReason::SubsystemFailed {
                subsystem: failure.subsystem().to_owned(),
            });
            Some(failure)
        };
        self.monitors.spawn(self.scope.bind(monitor));
        Ok(())
    }

    /// Number of monitors still running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.monitors.len()
    }

    /// Waits for every monitor to finish and returns the failures they saw.
    ///
    /// Monitors still running after [`DRAIN_TIMEOUT`] are abandoned.
    pub async fn drain(mut self) -> Vec<SubsystemFailure> {
        let mut failures = Vec::new();
        let collect = async {
            while let Some(joined) = self.monitors.join_next().await {
                match joined {
                    Ok(Some(failure)) => failures.push(failure),
                    Ok(None) => {}
                    Err(error) => {
                        warn!(target: SUPERVISION_TARGET, error = %error, "monitor task failed");
                    }
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, collect).await.is_err() {
            warn!(
                target: SUPERVISION_TARGET,
                remaining = self.monitors.len(),
                "subsystems did not close their error signals in time"
            );
            self.monitors.abort_all();
        }
        debug!(target: SUPERVISION_TARGET, failures = failures.len(), "supervision drained");
        failures
    }
}
