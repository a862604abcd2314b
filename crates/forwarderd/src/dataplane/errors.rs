//! Errors raised by the dataplane agent subsystem.

use std::io;
use std::process::ExitStatus;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Dataplane agent failures.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent executable could not be launched.
    #[error("failed to launch dataplane agent '{command}': {source}")]
    Spawn {
        /// Executable that was launched.
        command: Utf8PathBuf,
        /// Launch error.
        #[source]
        source: io::Error,
    },
    /// The agent exited before its control endpoint became ready.
    #[error("dataplane agent exited during startup with {status}")]
    ExitedDuringStartup {
        /// Exit status of the agent.
        status: ExitStatus,
    },
    /// The agent exited while the forwarder was running.
    #[error("dataplane agent exited unexpectedly with {status}")]
    Exited {
        /// Exit status of the agent.
        status: ExitStatus,
    },
    /// Waiting on the agent process failed.
    #[error("failed to wait on dataplane agent: {source}")]
    Wait {
        /// Wait error.
        #[source]
        source: io::Error,
    },
    /// The control endpoint could not be reached.
    #[error("failed to reach dataplane agent at {endpoint}: {source}")]
    Connect {
        /// Control endpoint.
        endpoint: String,
        /// Connect error.
        #[source]
        source: io::Error,
    },
    /// The control exchange failed mid-flight.
    #[error("dataplane agent exchange failed: {source}")]
    Io {
        /// I/O error.
        #[source]
        source: io::Error,
    },
    /// The agent answered with something that is not a reply.
    #[error("dataplane agent sent a malformed reply: {source}")]
    Protocol {
        /// Decode error.
        #[source]
        source: serde_json::Error,
    },
    /// The agent closed the connection without replying.
    #[error("dataplane agent closed the connection without replying")]
    NoReply,
    /// The agent refused the request.
    #[error("dataplane agent rejected {operation}: {message}")]
    Rejected {
        /// Operation that was refused.
        operation: &'static str,
        /// Agent's explanation.
        message: String,
    },
}
