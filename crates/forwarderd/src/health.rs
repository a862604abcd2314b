//! Structured health reporting for forwarder lifecycle events.

use std::sync::Arc;
use std::time::Duration;

use crate::bootstrap::{BootstrapError, Phase, ShutdownReport};
use crate::scope::CancelReason;
use crate::supervision::SubsystemFailure;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Observer trait used to surface lifecycle events to telemetry sinks.
///
/// Every hook receives the time elapsed since bootstrap began.
pub trait HealthReporter: Send + Sync {
    /// Invoked before configuration loading begins.
    fn bootstrap_starting(&self);

    /// Invoked as a bootstrap phase begins.
    fn phase_starting(&self, phase: Phase, elapsed: Duration);

    /// Invoked once a bootstrap phase has finished.
    fn phase_completed(&self, phase: Phase, elapsed: Duration);

    /// Invoked once every phase has completed.
    fn startup_completed(&self, elapsed: Duration);

    /// Invoked when bootstrap fails.
    fn startup_failed(&self, error: &BootstrapError, elapsed: Duration);

    /// Invoked when a running subsystem reports a failure.
    fn subsystem_failed(&self, failure: &SubsystemFailure, elapsed: Duration);

    /// Invoked when the scope is cancelled after a successful startup.
    fn shutdown_requested(&self, reason: &CancelReason, elapsed: Duration);

    /// Invoked once shutdown has drained.
    fn shutdown_completed(&self, report: &ShutdownReport, elapsed: Duration);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter + ?Sized,
{
    fn bootstrap_starting(&self) {
        (**self).bootstrap_starting();
    }

    fn phase_starting(&self, phase: Phase, elapsed: Duration) {
        (**self).phase_starting(phase, elapsed);
    }

    fn phase_completed(&self, phase: Phase, elapsed: Duration) {
        (**self).phase_completed(phase, elapsed);
    }

    fn startup_completed(&self, elapsed: Duration) {
        (**self).startup_completed(elapsed);
    }

    fn startup_failed(&self, error: &BootstrapError, elapsed: Duration) {
        (**self).startup_failed(error, elapsed);
    }

    fn subsystem_failed(&self, failure: &SubsystemFailure, elapsed: Duration) {
        (**self).subsystem_failed(failure, elapsed);
    }

    fn shutdown_requested(&self, reason: &CancelReason, elapsed: Duration) {
        (**self).shutdown_requested(reason, elapsed);
    }

    fn shutdown_completed(&self, report: &ShutdownReport, elapsed: Duration) {
        (**self).shutdown_completed(report, elapsed);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        let plan = Phase::ALL
            .iter()
            .map(|phase| format!("{}: {}", phase.number(), phase.description()))
            .collect::<Vec<_>>()
            .join("; ");
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_starting",
            phases = %plan,
            "starting forwarder bootstrap"
        );
    }

    fn phase_starting(&self, phase: Phase, elapsed: Duration) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "phase_starting",
            phase = phase.number(),
            elapsed_ms = millis(elapsed),
            "executing phase {}: {} (time since start: {elapsed:?})",
            phase.number(),
            phase.description(),
        );
    }

    fn phase_completed(&self, phase: Phase, elapsed: Duration) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "phase_completed",
            phase = phase.number(),
            elapsed_ms = millis(elapsed),
            "phase {} completed: {} (time since start: {elapsed:?})",
            phase.number(),
            phase.description(),
        );
    }

    fn startup_completed(&self, elapsed: Duration) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "startup_completed",
            elapsed_ms = millis(elapsed),
            "startup completed in {elapsed:?}"
        );
    }

    fn startup_failed(&self, error: &BootstrapError, elapsed: Duration) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "startup_failed",
            phase = error.phase().number(),
            elapsed_ms = millis(elapsed),
            error = %error,
            "forwarder startup failed"
        );
    }

    fn subsystem_failed(&self, failure: &SubsystemFailure, elapsed: Duration) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "subsystem_failed",
            subsystem = %failure.subsystem(),
            elapsed_ms = millis(elapsed),
            error = %failure.error(),
            "subsystem failed; cancelling the forwarder"
        );
    }

    fn shutdown_requested(&self, reason: &CancelReason, elapsed: Duration) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "shutdown_requested",
            reason = %reason,
            elapsed_ms = millis(elapsed),
            "forwarder shutting down"
        );
    }

    fn shutdown_completed(&self, report: &ShutdownReport, elapsed: Duration) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "shutdown_completed",
            failures = report.failures().len(),
            success = report.is_success(),
            elapsed_ms = millis(elapsed),
            "forwarder stopped"
        );
    }
}
