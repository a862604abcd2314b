//! Listening sockets for the RPC server.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::warn;

use forwarder_config::SocketEndpoint;

use super::{IoStream, ListenerError, TRANSPORT_TARGET};

#[cfg(unix)]
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
#[cfg(unix)]
use std::os::unix::net::UnixStream as StdUnixStream;
#[cfg(unix)]
use std::path::Path;

/// Listener bound to a socket endpoint.
///
/// A Unix socket file created by the listener is removed when the listener is
/// dropped.
#[derive(Debug)]
pub(crate) struct SocketListener {
    endpoint: SocketEndpoint,
    listener: ListenerKind,
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl SocketListener {
    /// Binds `endpoint`. Must be called from within a Tokio runtime.
    pub(crate) fn bind(endpoint: &SocketEndpoint) -> Result<Self, ListenerError> {
        match endpoint {
            SocketEndpoint::Tcp { host, port } => {
                let listener = bind_tcp(host, *port)?;
                Ok(Self {
                    endpoint: endpoint.clone(),
                    listener: ListenerKind::Tcp(listener),
                })
            }
            SocketEndpoint::Unix { path } => {
                #[cfg(unix)]
                {
                    let listener = bind_unix(path.as_std_path())?;
                    Ok(Self {
                        endpoint: endpoint.clone(),
                        listener: ListenerKind::Unix(listener),
                    })
                }

                #[cfg(not(unix))]
                {
                    let _ = path;
                    Err(ListenerError::UnsupportedUnix {
                        endpoint: endpoint.to_string(),
                    })
                }
            }
        }
    }

    /// Endpoint the listener serves.
    pub(crate) fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// Bound TCP address, useful when the endpoint asked for port 0.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            ListenerKind::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            ListenerKind::Unix(_) => None,
        }
    }

    /// Accepts the next connection.
    pub(crate) async fn accept(&self) -> io::Result<IoStream> {
        match &self.listener {
            ListenerKind::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(IoStream::Tcp(stream))
            }
            #[cfg(unix)]
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(IoStream::Unix(stream))
            }
        }
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        cleanup_unix_socket(&self.endpoint);
    }
}

fn bind_tcp(host: &str, port: u16) -> Result<TcpListener, ListenerError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ListenerError::Resolve {
            host: host.to_string(),
            port,
            source,
        })?;
    let addr = addrs
        .find(|addr| matches!(addr, SocketAddr::V4(_) | SocketAddr::V6(_)))
        .ok_or_else(|| ListenerError::ResolveEmpty {
            host: host.to_string(),
            port,
        })?;
    let listener =
        StdTcpListener::bind(addr).map_err(|source| ListenerError::BindTcp { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| ListenerError::Register { source })?;
    TcpListener::from_std(listener).map_err(|source| ListenerError::Register { source })
}

#[cfg(unix)]
fn bind_unix(path: &Path) -> Result<UnixListener, ListenerError> {
    if path.exists() {
        let metadata =
            fs::symlink_metadata(path).map_err(|source| ListenerError::UnixMetadata {
                path: path.display().to_string(),
                source,
            })?;
        if !metadata.file_type().is_socket() {
            return Err(ListenerError::UnixNotSocket {
                path: path.display().to_string(),
            });
        }
        match StdUnixStream::connect(path) {
            Ok(_stream) => {
                return Err(ListenerError::UnixInUse {
                    path: path.display().to_string(),
                });
            }
            Err(error)
                if error.kind() == io::ErrorKind::ConnectionRefused
                    || error.kind() == io::ErrorKind::NotFound =>
            {
                fs::remove_file(path).map_err(|source| ListenerError::UnixCleanup {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            Err(error) => {
                return Err(ListenerError::UnixConnect {
                    path: path.display().to_string(),
                    source: error,
                });
            }
        }
    }
    UnixListener::bind(path).map_err(|source| ListenerError::BindUnix {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(unix)]
fn cleanup_unix_socket(endpoint: &SocketEndpoint) {
    let SocketEndpoint::Unix { path } = endpoint else {
        return;
    };
    if let Err(error) = fs::remove_file(path.as_std_path())
        && error.kind() != io::ErrorKind::NotFound
    {
        warn!(
            target: TRANSPORT_TARGET,
            error = %error,
            path = %path,
            "failed to remove unix socket file"
        );
    }
}
