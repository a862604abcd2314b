//! Errors raised by the RPC server and client.

use std::io;

use thiserror::Error;

use forwarder_config::SocketPreparationError;

use crate::transport::ListenerError;

use super::RpcStatus;

/// RPC transport failures.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The socket directory could not be prepared.
    #[error("failed to prepare socket directory: {source}")]
    Prepare {
        /// Filesystem error.
        #[source]
        source: SocketPreparationError,
    },
    /// The listening socket could not be bound.
    #[error("failed to listen: {source}")]
    Listen {
        /// Bind error.
        #[source]
        source: ListenerError,
    },
    /// Accepting connections failed in a way that will not recover.
    #[error("failed to accept connections: {source}")]
    Accept {
        /// Accept error.
        #[source]
        source: io::Error,
    },
    /// The endpoint host is not a valid TLS server name.
    #[error("invalid TLS server name '{name}'")]
    ServerName {
        /// Rejected name.
        name: String,
    },
    /// Dialling the server failed.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// Target endpoint.
        endpoint: String,
        /// Connect error.
        #[source]
        source: io::Error,
    },
    /// The TLS handshake failed.
    #[error("TLS handshake with {endpoint} failed: {source}")]
    Handshake {
        /// Target endpoint.
        endpoint: String,
        /// Handshake error.
        #[source]
        source: io::Error,
    },
    /// Reading or writing a frame failed.
    #[error("RPC exchange failed: {source}")]
    Io {
        /// I/O error.
        #[source]
        source: io::Error,
    },
    /// The server sent something that is not a response.
    #[error("malformed RPC response: {source}")]
    Protocol {
        /// Decode error.
        #[source]
        source: serde_json::Error,
    },
    /// The server closed the connection without answering.
    #[error("server closed the connection without a response")]
    NoResponse,
    /// The server answered with an error status.
    #[error("call failed with {status}")]
    Status {
        /// Returned status.
        #[source]
        status: RpcStatus,
    },
}

impl RpcError {
    /// The remote status, when the server answered with one.
    #[must_use]
    pub fn status(&self) -> Option<&RpcStatus> {
        match self {
            Self::Status { status } => Some(status),
            _ => None,
        }
    }
}
