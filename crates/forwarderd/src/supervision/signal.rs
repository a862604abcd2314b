//! Single-shot failure channels.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// A failure reported by a running subsystem.
#[derive(Clone)]
pub struct SubsystemFailure {
    subsystem: Arc<str>,
    error: Arc<dyn Error + Send + Sync>,
}

impl SubsystemFailure {
    /// Wraps `error` as a failure of `subsystem`.
    pub fn new<E>(subsystem: &str, error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            subsystem: Arc::from(subsystem),
            error: Arc::new(error),
        }
    }

    /// Name of the subsystem that failed.
    #[must_use]
    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    /// The reported error.
    #[must_use]
    pub fn error(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.error
    }
}

impl fmt::Debug for SubsystemFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SubsystemFailure")
            .field("subsystem", &self.subsystem)
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for SubsystemFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}: {}", self.subsystem, self.error)
    }
}

impl Error for SubsystemFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&*self.error)
    }
}

#[derive(Debug, Clone)]
enum SignalState {
    Pending,
    Failed(SubsystemFailure),
    Closed,
}

/// Creates a connected reporter and signal for `subsystem`.
#[must_use]
pub fn error_signal(subsystem: &str) -> (FailureReporter, ErrorSignal) {
    let (sender, receiver) = watch::channel(SignalState::Pending);
    let subsystem: Arc<str> = Arc::from(subsystem);
    (
        FailureReporter {
            subsystem: Arc::clone(&subsystem),
            sender,
        },
        ErrorSignal {
            subsystem,
            receiver,
        },
    )
}

/// Write side of an [`ErrorSignal`], owned by the subsystem.
///
/// A reporter delivers at most one failure: [`FailureReporter::fail`]
/// consumes it. Dropping it without failing closes the signal cleanly.
#[derive(Debug)]
pub struct FailureReporter {
    subsystem: Arc<str>,
    sender: watch::Sender<SignalState>,
}

impl FailureReporter {
    /// Name of the subsystem this reporter speaks for.
    #[must_use]
    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    /// Reports `error` and closes the signal.
    pub fn fail<E>(self, error: E)
    where
        E: Error + Send + Sync + 'static,
    {
        let failure = SubsystemFailure::new(&self.subsystem, error);
        self.sender.send_replace(SignalState::Failed(failure));
    }

    /// Closes the signal without reporting a failure.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for FailureReporter {
    fn drop(&mut self) {
        self.sender.send_if_modified(|state| {
            if matches!(state, SignalState::Pending) {
                *state = SignalState::Closed;
                true
            } else {
                false
            }
        });
    }
}

/// Read side of a subsystem's failure channel.
///
/// The signal resolves exactly once, either to a failure or to a clean close.
/// Clones observe the same outcome.
#[derive(Debug, Clone)]
pub struct ErrorSignal {
    subsystem: Arc<str>,
    receiver: watch::Receiver<SignalState>,
}

impl ErrorSignal {
    /// Name of the subsystem behind the signal.
    #[must_use]
    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    /// The failure already reported, without waiting.
    #[must_use]
    pub fn peek(&self) -> Option<SubsystemFailure> {
        match &*self.receiver.borrow() {
            SignalState::Failed(failure) => Some(failure.clone()),
            SignalState::Pending | SignalState::Closed => None,
        }
    }

    /// Whether the subsystem has reported a failure or closed the signal.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !matches!(&*self.receiver.borrow(), SignalState::Pending)
    }

    /// Waits for the signal to resolve. Returns the failure, or `None` when
    /// the subsystem closed the signal cleanly.
    pub async fn wait(&self) -> Option<SubsystemFailure> {
        let mut receiver = self.receiver.clone();
        let outcome = match receiver
            .wait_for(|state| !matches!(state, SignalState::Pending))
            .await
        {
            Ok(state) => match &*state {
                SignalState::Failed(failure) => Some(failure.clone()),
                SignalState::Pending | SignalState::Closed => None,
            },
            Err(_) => None,
        };
        outcome
    }

    /// Waits until the subsystem has released its reporter, meaning it has
    /// finished shutting down.
    pub async fn closed(&self) {
        let mut receiver = self.receiver.clone();
        while receiver.changed().await.is_ok() {}
    }
}

/// A running subsystem's resource and its failure signal.
#[derive(Debug)]
pub struct SubsystemHandle<R> {
    /// Resource the subsystem exposes to later phases.
    pub resource: R,
    /// Failure channel for the subsystem.
    pub errors: ErrorSignal,
}

impl<R> SubsystemHandle<R> {
    /// Pairs `resource` with `errors`.
    pub fn new(resource: R, errors: ErrorSignal) -> Self {
        Self { resource, errors }
    }
}
