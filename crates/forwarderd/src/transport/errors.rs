//! Error types for socket listener operations.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced while binding a listening socket.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The TCP host could not be resolved.
    #[error("failed to resolve TCP address {host}:{port}: {source}")]
    Resolve {
        /// Host from the endpoint.
        host: String,
        /// Port from the endpoint.
        port: u16,
        /// Resolver error.
        #[source]
        source: io::Error,
    },
    /// The TCP host resolved to nothing.
    #[error("no TCP addresses resolved for {host}:{port}")]
    ResolveEmpty {
        /// Host from the endpoint.
        host: String,
        /// Port from the endpoint.
        port: u16,
    },
    /// Binding the TCP socket failed.
    #[error("failed to bind TCP listener at {addr}: {source}")]
    BindTcp {
        /// Address that was tried.
        addr: SocketAddr,
        /// Bind error.
        #[source]
        source: io::Error,
    },
    /// The socket could not be handed to the async runtime.
    #[error("failed to register listener with the runtime: {source}")]
    Register {
        /// Registration error.
        #[source]
        source: io::Error,
    },
    /// Unix sockets are not available on this platform.
    #[cfg(not(unix))]
    #[error("unix sockets are unsupported for endpoint {endpoint}")]
    UnsupportedUnix {
        /// Requested endpoint.
        endpoint: String,
    },
    /// Binding the Unix socket failed.
    #[cfg(unix)]
    #[error("failed to bind unix listener at {path}: {source}")]
    BindUnix {
        /// Socket path.
        path: String,
        /// Bind error.
        #[source]
        source: io::Error,
    },
    /// Another process is serving on the socket path.
    #[cfg(unix)]
    #[error("existing unix socket {path} is already in use")]
    UnixInUse {
        /// Socket path.
        path: String,
    },
    /// The path exists but is not a socket.
    #[cfg(unix)]
    #[error("unix socket path {path} is not a socket")]
    UnixNotSocket {
        /// Offending path.
        path: String,
    },
    /// The existing path could not be inspected.
    #[cfg(unix)]
    #[error("failed to read metadata for unix socket {path}: {source}")]
    UnixMetadata {
        /// Socket path.
        path: String,
        /// Metadata error.
        #[source]
        source: io::Error,
    },
    /// Probing the existing socket failed unexpectedly.
    #[cfg(unix)]
    #[error("failed to connect to existing unix socket {path}: {source}")]
    UnixConnect {
        /// Socket path.
        path: String,
        /// Connect error.
        #[source]
        source: io::Error,
    },
    /// A stale socket file could not be removed.
    #[cfg(unix)]
    #[error("failed to remove stale unix socket {path}: {source}")]
    UnixCleanup {
        /// Socket path.
        path: String,
        /// Removal error.
        #[source]
        source: io::Error,
    },
}
