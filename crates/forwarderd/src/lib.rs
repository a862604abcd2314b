//! Startup and supervision core of the network service mesh forwarder.
//!
//! The forwarder boots in five strictly ordered phases:
//!
//! 1. load configuration from the environment and build telemetry;
//! 2. start the dataplane agent;
//! 3. obtain the SPIFFE SVID and derive mutual-TLS credentials from it;
//! 4. build the cross-connect endpoint chain;
//! 5. start the RPC server and register the endpoint on it.
//!
//! A failure in any phase ends the process. Once running, the agent and the
//! server each expose a one-shot error signal. The [`Supervisor`] peeks every
//! signal as it is attached and then monitors it in the background; the first
//! failure, or a termination signal, cancels the shared [`Scope`]. Shutdown
//! always waits for the dataplane agent to stop before the process exits.
//!
//! Logging never touches the global subscriber. The configured dispatcher
//! travels with the [`Scope`] and is attached to every task it spawns.

mod bootstrap;
pub mod dataplane;
pub mod endpoint;
mod health;
mod identity;
mod launch;
pub mod rpc;
mod scope;
mod shutdown;
pub mod supervision;
mod telemetry;
mod transport;

pub use bootstrap::{
    BootstrapError, Collaborators, ConfigLoader, Forwarder, Phase, ShutdownReport,
    StaticConfigLoader, SystemConfigLoader, bootstrap_with,
};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use identity::{FileIdentityProvider, IdentityProvider};
pub use launch::{run_forwarder, run_forwarder_with};
pub use scope::{CancelReason, Scope};
pub use shutdown::{ManualShutdown, ShutdownSignal, SystemShutdownSignal};
pub use supervision::{ErrorSignal, SubsystemFailure, SubsystemHandle, Supervisor};
pub use telemetry::{TelemetryError, TelemetryHandle};
pub use transport::ListenerError;

#[cfg(test)]
mod tests;
