//! Error-signal fan-in for running subsystems.
//!
//! Each long-lived subsystem hands back an [`ErrorSignal`] alongside its
//! resource. The subsystem owns the matching [`FailureReporter`] and uses it to
//! report at most one failure; dropping the reporter closes the signal. The
//! [`Supervisor`] inspects each signal as it is registered (an
//! already-reported failure is fatal at startup) and otherwise monitors it in
//! the background, cancelling the shared scope on the first failure.

mod signal;
mod supervisor;

pub use self::signal::{ErrorSignal, FailureReporter, SubsystemFailure, SubsystemHandle, error_signal};
pub use self::supervisor::{DRAIN_TIMEOUT, Supervisor};

const SUPERVISION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::supervision");
