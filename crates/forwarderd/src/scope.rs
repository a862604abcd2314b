//! The process-wide cancellation scope.
//!
//! Every long-lived task the forwarder starts is spawned through a [`Scope`].
//! The scope couples three things that must travel together: the cancellation
//! token shared by all subsystems, the root span carrying the process's
//! structured fields, and the telemetry dispatcher those spans report to.
//! Cancellation is one-shot: the first caller records why the scope ended and
//! every later call is a no-op.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::{Instrument, Instrumented, WithDispatch, WithSubscriber};
use tracing::{Span, debug, info, warn};

use crate::shutdown::ShutdownSignal;
use crate::telemetry::TelemetryHandle;

const SCOPE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::scope");

/// Why the scope was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The process received a termination signal.
    Signal,
    /// A supervised subsystem reported a failure.
    SubsystemFailed {
        /// Name of the failing subsystem.
        subsystem: String,
    },
    /// Bootstrap aborted after some subsystems had started.
    StartupAborted,
    /// An embedder asked the forwarder to stop.
    Requested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal => formatter.write_str("termination signal"),
            Self::SubsystemFailed { subsystem } => write!(formatter, "{subsystem} failed"),
            Self::StartupAborted => formatter.write_str("startup aborted"),
            Self::Requested => formatter.write_str("shutdown requested"),
        }
    }
}

/// Shared cancellation scope and logging context.
///
/// Cloning is cheap; all clones observe the same cancellation.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    token: CancellationToken,
    reason: OnceLock<CancelReason>,
    span: Span,
    telemetry: TelemetryHandle,
    started: Instant,
}

impl fmt::Debug for Scope {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Scope")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

impl Scope {
    /// Creates a scope whose root span carries `cmd` and `name`.
    ///
    /// `started` is the instant the process began its bootstrap; elapsed
    /// times logged through the scope are measured from it.
    #[must_use]
    pub fn new(telemetry: TelemetryHandle, started: Instant, cmd: &str, name: &str) -> Self {
        let span = tracing::dispatcher::with_default(telemetry.dispatch(), || {
            tracing::info_span!(target: SCOPE_TARGET, "forwarder", cmd = %cmd, name = %name)
        });
        Self {
            inner: Arc::new(ScopeInner {
                token: CancellationToken::new(),
                reason: OnceLock::new(),
                span,
                telemetry,
                started,
            }),
        }
    }

    /// Cancels the scope. Returns `true` for the call that actually cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        if self.inner.reason.set(reason).is_err() {
            return false;
        }
        self.inner.token.cancel();
        true
    }

    /// Whether the scope has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Completes once the scope is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Why the scope was cancelled, if it has been.
    #[must_use]
    pub fn reason(&self) -> Option<&CancelReason> {
        self.inner.reason.get()
    }

    /// Token that fires with the scope but cannot cancel it.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    /// Time since the process began bootstrapping.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Root span of the process.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Telemetry the scope reports to.
    #[must_use]
    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.inner.telemetry
    }

    /// Binds `future` to the scope's span and dispatcher.
    pub fn bind<F>(&self, future: F) -> WithDispatch<Instrumented<F>>
    where
        F: Future,
    {
        future
            .instrument(self.inner.span.clone())
            .with_subscriber(self.inner.telemetry.dispatch().clone())
    }

    /// Spawns `future` onto the runtime inside the scope's logging context.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(self.bind(future))
    }

    /// Cancels the scope when `signal` fires.
    ///
    /// The watcher stops quietly if the scope is cancelled for any other
    /// reason first.
    pub fn arm_signals(&self, signal: Arc<dyn ShutdownSignal>) -> JoinHandle<()> {
        let scope = self.clone();
        self.spawn(async move {
            tokio::select! {
                biased;
                () = scope.cancelled() => {}
                outcome = signal.wait() => match outcome {
                    Ok(()) => {
                        if scope.cancel(CancelReason::Signal) {
                            info!(target: SCOPE_TARGET, "termination signal received");
                        }
                    }
                    Err(error) => {
                        warn!(
                            target: SCOPE_TARGET,
                            error = %error,
                            "signal handling unavailable; only subsystem failures will stop the forwarder"
                        );
                    }
                },
            }
            debug!(target: SCOPE_TARGET, "signal watcher stopped");
        })
    }
}
