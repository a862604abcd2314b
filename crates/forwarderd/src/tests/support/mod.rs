//! Test harness utilities for the forwarder suites.

mod collaborators;
mod fakes;
mod reporter;
mod world;

pub use collaborators::{
    AgentScript, IdentityScript, ScriptedAgent, ScriptedEndpointBuilder, ScriptedIdentity,
    ScriptedTransport, TransportScript, quiet_config,
};
pub use fakes::{FakeAgent, FixedTunnel, TRUST_DOMAIN, Upstream, quiet_scope};
pub use reporter::{HealthEvent, RecordingHealthReporter};
pub use world::{TestWorld, world};
