//! The dataplane agent subsystem.
//!
//! The forwarder does not program the dataplane itself. It launches an agent
//! process, waits until the agent's control endpoint answers, and then hands
//! later phases an [`AgentConnection`] for pushing configuration. The agent's
//! error signal reports the process exiting on its own; a clean shutdown
//! closes the signal only after the process has gone.

mod connection;
mod errors;
mod process;

use async_trait::async_trait;

use forwarder_config::Config;

use crate::scope::Scope;
use crate::supervision::SubsystemHandle;

pub use self::connection::AgentConnection;
pub use self::errors::AgentError;
pub use self::process::{AGENT_READY_POLL, AGENT_STOP_TIMEOUT, ProcessAgent};

const DATAPLANE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dataplane");

/// Name the agent reports failures under.
pub const AGENT_SUBSYSTEM: &str = "dataplane-agent";

/// Starts the dataplane agent.
#[async_trait]
pub trait DataplaneAgent: Send + Sync {
    /// Starts the agent under `scope` and returns its connection.
    ///
    /// Start failures are reported through the returned signal rather than
    /// as an error, so the caller treats them like any other agent failure.
    /// When `scope` is cancelled the agent must stop and then close the
    /// signal.
    async fn start(&self, scope: &Scope, config: &Config) -> SubsystemHandle<AgentConnection>;
}
