//! Configuration for the forwarder process.
//!
//! The forwarder reads its settings once, before any subsystem starts, from
//! `NSM_*` environment variables and an optional configuration file layered by
//! [`ortho_config`]. The resulting [`Config`] is immutable for the life of the
//! process and is shared by reference with every bootstrap phase.

mod defaults;
mod duration;
mod logging;
mod policy;
mod socket;

use std::net::IpAddr;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use defaults::{
    DEFAULT_AGENT_COMMAND, DEFAULT_AGENT_CONFIG_DIR, DEFAULT_AGENT_PORT, DEFAULT_BASE_DIR,
    DEFAULT_CONNECT_TO, DEFAULT_IDENTITY_DIR, DEFAULT_IDENTITY_REFRESH_SECS, DEFAULT_LISTEN_ON,
    DEFAULT_LOG_FILTER, DEFAULT_MAX_TOKEN_LIFETIME_SECS, DEFAULT_NAME, default_log_filter,
    default_log_format,
};
pub use duration::HumanDuration;
pub use logging::{LogFormat, LogFormatParseError};
pub use policy::{FailurePolicy, FailurePolicyParseError};
pub use socket::{SocketEndpoint, SocketParseError, SocketPreparationError};

/// Settings shared by every phase of the forwarder bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "NSM")]
#[serde(default)]
pub struct Config {
    /// Name of the forwarder, used in network service paths.
    #[ortho_config(default = defaults::default_name())]
    pub name: String,
    /// Directory for files the endpoint chain writes.
    #[ortho_config(default = defaults::default_base_dir())]
    pub base_dir: Utf8PathBuf,
    /// Local address used as the source of remote tunnels.
    pub tunnel_ip: Option<IpAddr>,
    /// Endpoint the RPC server listens on.
    #[ortho_config(default = defaults::default_listen_on())]
    pub listen_on: SocketEndpoint,
    /// Endpoint of the upstream manager.
    #[ortho_config(default = defaults::default_connect_to())]
    pub connect_to: SocketEndpoint,
    /// Upper bound on the lifetime of issued tokens.
    #[ortho_config(default = defaults::default_max_token_lifetime())]
    pub max_token_lifetime: HumanDuration,
    /// Dataplane agent executable.
    #[ortho_config(default = defaults::default_agent_command())]
    pub agent_command: Utf8PathBuf,
    /// Configuration directory handed to the dataplane agent.
    #[ortho_config(default = defaults::default_agent_config_dir())]
    pub agent_config_dir: Utf8PathBuf,
    /// Control endpoint the dataplane agent serves once ready.
    #[ortho_config(default = defaults::default_agent_endpoint())]
    pub agent_endpoint: SocketEndpoint,
    /// Directory holding `svid.pem`, `svid_key.pem` and `bundle.pem`.
    #[ortho_config(default = defaults::default_identity_dir())]
    pub identity_dir: Utf8PathBuf,
    /// Interval between checks for rotated identity files.
    #[ortho_config(default = defaults::default_identity_refresh())]
    pub identity_refresh: HumanDuration,
    /// Exit behaviour after a subsystem fails in flight.
    #[ortho_config(default = defaults::default_failure_policy())]
    pub failure_policy: FailurePolicy,
    /// `tracing` filter expression.
    #[ortho_config(default = defaults::default_log_filter_string())]
    pub log_filter: String,
    /// Log output encoding.
    #[ortho_config(default = defaults::default_log_format())]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: defaults::default_name(),
            base_dir: defaults::default_base_dir(),
            tunnel_ip: None,
            listen_on: defaults::default_listen_on(),
            connect_to: defaults::default_connect_to(),
            max_token_lifetime: defaults::default_max_token_lifetime(),
            agent_command: defaults::default_agent_command(),
            agent_config_dir: defaults::default_agent_config_dir(),
            agent_endpoint: defaults::default_agent_endpoint(),
            identity_dir: defaults::default_identity_dir(),
            identity_refresh: defaults::default_identity_refresh(),
            failure_policy: defaults::default_failure_policy(),
            log_filter: defaults::default_log_filter_string(),
            log_format: defaults::default_log_format(),
        }
    }
}

impl Config {
    /// Forwarder name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint the RPC server listens on.
    #[must_use]
    pub fn listen_on(&self) -> &SocketEndpoint {
        &self.listen_on
    }

    /// Endpoint of the upstream manager.
    #[must_use]
    pub fn connect_to(&self) -> &SocketEndpoint {
        &self.connect_to
    }

    /// Control endpoint of the dataplane agent.
    #[must_use]
    pub fn agent_endpoint(&self) -> &SocketEndpoint {
        &self.agent_endpoint
    }

    /// Configured log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Configured log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Policy applied to in-flight subsystem failures.
    #[must_use]
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Checks invariants that the loader cannot express through types.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigValidationError::EmptyName);
        }
        if self.max_token_lifetime.is_zero() {
            return Err(ConfigValidationError::ZeroTokenLifetime);
        }
        if self.identity_refresh.is_zero() {
            return Err(ConfigValidationError::ZeroIdentityRefresh);
        }
        if self.listen_on == self.connect_to {
            return Err(ConfigValidationError::ListenEqualsUpstream {
                endpoint: self.listen_on.to_string(),
            });
        }
        Ok(())
    }
}

/// Semantic problems found in an otherwise well-formed configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// The forwarder name was blank.
    #[error("forwarder name must not be empty")]
    EmptyName,
    /// Tokens would expire as soon as they were issued.
    #[error("max token lifetime must be greater than zero")]
    ZeroTokenLifetime,
    /// The identity refresh loop would spin.
    #[error("identity refresh interval must be greater than zero")]
    ZeroIdentityRefresh,
    /// The forwarder would dial itself.
    #[error("listen endpoint {endpoint} is also the upstream endpoint")]
    ListenEqualsUpstream {
        /// The endpoint configured for both roles.
        endpoint: String,
    },
}
