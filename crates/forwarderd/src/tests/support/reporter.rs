//! Test double for [`HealthReporter`] that records lifecycle events for
//! assertions.

use std::sync::Mutex;
use std::time::Duration;

use crate::bootstrap::{BootstrapError, Phase, ShutdownReport};
use crate::health::HealthReporter;
use crate::scope::CancelReason;
use crate::supervision::SubsystemFailure;

/// Lifecycle events tracked during scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// Bootstrap started.
    BootstrapStarting,
    /// A phase began.
    PhaseStarting(Phase),
    /// A phase finished.
    PhaseCompleted(Phase),
    /// Every phase finished.
    StartupCompleted,
    /// Bootstrap failed in a phase.
    StartupFailed {
        /// Failing phase.
        phase: Phase,
        /// Rendered error.
        message: String,
    },
    /// A running subsystem failed.
    SubsystemFailed {
        /// Failing subsystem.
        subsystem: String,
    },
    /// The scope was cancelled after startup.
    ShutdownRequested(CancelReason),
    /// Shutdown drained.
    ShutdownCompleted {
        /// Failures in the report.
        failures: usize,
    },
}

/// Records health events for assertions.
#[derive(Debug, Default)]
pub struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    /// Captures a copy of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&HealthEvent) -> bool) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn bootstrap_starting(&self) {
        self.record(HealthEvent::BootstrapStarting);
    }

    fn phase_starting(&self, phase: Phase, _elapsed: Duration) {
        self.record(HealthEvent::PhaseStarting(phase));
    }

    fn phase_completed(&self, phase: Phase, _elapsed: Duration) {
        self.record(HealthEvent::PhaseCompleted(phase));
    }

    fn startup_completed(&self, _elapsed: Duration) {
        self.record(HealthEvent::StartupCompleted);
    }

    fn startup_failed(&self, error: &BootstrapError, _elapsed: Duration) {
        self.record(HealthEvent::StartupFailed {
            phase: error.phase(),
            message: error.to_string(),
        });
    }

    fn subsystem_failed(&self, failure: &SubsystemFailure, _elapsed: Duration) {
        self.record(HealthEvent::SubsystemFailed {
            subsystem: failure.subsystem().to_owned(),
        });
    }

    fn shutdown_requested(&self, reason: &CancelReason, _elapsed: Duration) {
        self.record(HealthEvent::ShutdownRequested(reason.clone()));
    }

    fn shutdown_completed(&self, report: &ShutdownReport, _elapsed: Duration) {
        self.record(HealthEvent::ShutdownCompleted {
            failures: report.failures().len(),
        });
    }
}
