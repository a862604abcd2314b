use camino::Utf8PathBuf;

use crate::duration::HumanDuration;
use crate::logging::LogFormat;
use crate::policy::FailurePolicy;
use crate::socket::SocketEndpoint;

/// Default forwarder name, used as the endpoint name in network service paths.
pub const DEFAULT_NAME: &str = "forwarder";

/// Default base directory for files the endpoint chain writes.
pub const DEFAULT_BASE_DIR: &str = "./";

/// Default URL the RPC server listens on.
pub const DEFAULT_LISTEN_ON: &str = "unix:///listen.on.socket";

/// Default URL of the upstream manager the endpoint chain dials.
pub const DEFAULT_CONNECT_TO: &str = "unix:///connect.to.socket";

/// Default upper bound on issued token lifetimes.
pub const DEFAULT_MAX_TOKEN_LIFETIME_SECS: u64 = 24 * 60 * 60;

/// Default dataplane agent executable.
pub const DEFAULT_AGENT_COMMAND: &str = "vpp-agent";

/// Default dataplane agent configuration directory.
pub const DEFAULT_AGENT_CONFIG_DIR: &str = "/etc/vpp-agent";

/// Default TCP port of the dataplane agent's control endpoint.
pub const DEFAULT_AGENT_PORT: u16 = 9111;

/// Default directory holding the workload identity files.
pub const DEFAULT_IDENTITY_DIR: &str = "/run/spire/svid";

/// Default interval between identity file checks.
pub const DEFAULT_IDENTITY_REFRESH_SECS: u64 = 5;

/// Default log filter expression used by the forwarder.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default forwarder name as an owned value.
pub fn default_name() -> String {
    DEFAULT_NAME.to_owned()
}

/// Default base directory.
pub fn default_base_dir() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_BASE_DIR)
}

/// Default listen endpoint.
pub fn default_listen_on() -> SocketEndpoint {
    SocketEndpoint::unix("/listen.on.socket")
}

/// Default upstream endpoint.
pub fn default_connect_to() -> SocketEndpoint {
    SocketEndpoint::unix("/connect.to.socket")
}

/// Default token lifetime bound.
pub fn default_max_token_lifetime() -> HumanDuration {
    HumanDuration::from_secs(DEFAULT_MAX_TOKEN_LIFETIME_SECS)
}

/// Default dataplane agent executable.
pub fn default_agent_command() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_AGENT_COMMAND)
}

/// Default dataplane agent configuration directory.
pub fn default_agent_config_dir() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_AGENT_CONFIG_DIR)
}

/// Default dataplane agent control endpoint.
pub fn default_agent_endpoint() -> SocketEndpoint {
    SocketEndpoint::tcp("127.0.0.1", DEFAULT_AGENT_PORT)
}

/// Default identity directory.
pub fn default_identity_dir() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_IDENTITY_DIR)
}

/// Default identity refresh interval.
pub fn default_identity_refresh() -> HumanDuration {
    HumanDuration::from_secs(DEFAULT_IDENTITY_REFRESH_SECS)
}

/// Default in-flight failure policy.
pub fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::Cancel
}

/// Default log filter expression.
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}
