use std::fmt;
use std::fs::DirBuilder;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use url::Url;

/// Address of a socket the forwarder listens on or dials.
///
/// Endpoints are written as URLs, `unix:///path/to.sock` or
/// `tcp://host:port`, in both the environment and configuration files.
/// Configuration files may also spell them as tables tagged by `transport`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocketEndpoint {
    /// Unix domain socket endpoint.
    Unix {
        /// Filesystem path of the socket.
        path: Utf8PathBuf,
    },
    /// TCP socket endpoint.
    Tcp {
        /// Host name or address literal.
        host: String,
        /// TCP port.
        port: u16,
    },
}

impl SocketEndpoint {
    /// Builds a Unix domain socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Builds a TCP socket endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Returns the Unix socket path when the endpoint uses the Unix transport.
    #[must_use]
    pub fn unix_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Unix { path } => Some(path.as_ref()),
            Self::Tcp { .. } => None,
        }
    }

    /// Host name presented to TLS peers when dialling this endpoint.
    ///
    /// Unix sockets have no host, so a fixed label is used. SPIFFE peers are
    /// authenticated by URI SAN rather than by name, so the label only needs to
    /// be syntactically valid.
    #[must_use]
    pub fn tls_server_name(&self) -> &str {
        match self {
            Self::Unix { .. } => "localhost",
            Self::Tcp { host, .. } => host,
        }
    }

    /// Ensures the socket's parent directory exists with restrictive permissions.
    pub fn prepare_filesystem(&self) -> Result<(), SocketPreparationError> {
        let Some(path) = self.unix_path() else {
            return Ok(());
        };
        let Some(parent) = path.parent() else {
            return Err(SocketPreparationError::MissingParent {
                path: path.to_path_buf(),
            });
        };
        if parent.as_str().is_empty() {
            return Ok(());
        }

        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }

        if let Err(source) = builder.create(parent.as_std_path())
            && source.kind() != std::io::ErrorKind::AlreadyExists
        {
            return Err(SocketPreparationError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            });
        }

        Ok(())
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(formatter, "unix://{path}"),
            Self::Tcp { host, port } => write!(formatter, "tcp://{host}:{port}"),
        }
    }
}

impl FromStr for SocketEndpoint {
    type Err = SocketParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(input)?;
        match url.scheme() {
            "unix" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(SocketParseError::MissingUnixPath(input.to_owned()));
                }
                Ok(Self::unix(path))
            }
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| SocketParseError::MissingHost(input.to_owned()))?;
                let port = url
                    .port()
                    .ok_or_else(|| SocketParseError::MissingPort(input.to_owned()))?;
                Ok(Self::tcp(host.trim_start_matches('[').trim_end_matches(']'), port))
            }
            other => Err(SocketParseError::UnsupportedScheme(other.to_owned())),
        }
    }
}

impl Serialize for SocketEndpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

#[derive(Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
enum TaggedEndpoint {
    Unix { path: Utf8PathBuf },
    Tcp { host: String, port: u16 },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EndpointRepr {
    Url(String),
    Tagged(TaggedEndpoint),
}

impl<'de> Deserialize<'de> for SocketEndpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match EndpointRepr::deserialize(deserializer)? {
            EndpointRepr::Url(text) => text.parse().map_err(serde::de::Error::custom),
            EndpointRepr::Tagged(TaggedEndpoint::Unix { path }) => Ok(Self::Unix { path }),
            EndpointRepr::Tagged(TaggedEndpoint::Tcp { host, port }) => {
                Ok(Self::Tcp { host, port })
            }
        }
    }
}

/// Errors encountered while parsing a [`SocketEndpoint`] from text.
#[derive(Debug, Error)]
pub enum SocketParseError {
    /// Scheme was not recognised.
    #[error("unsupported socket scheme '{0}'")]
    UnsupportedScheme(String),
    /// TCP host name was missing.
    #[error("missing TCP host in '{0}'")]
    MissingHost(String),
    /// TCP port was missing from the address.
    #[error("missing TCP port in '{0}'")]
    MissingPort(String),
    /// Unix socket path was absent.
    #[error("missing Unix socket path in '{0}'")]
    MissingUnixPath(String),
    /// URL failed to parse.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

/// Errors raised when preparing socket directories.
#[derive(Debug, Error)]
pub enum SocketPreparationError {
    /// Parent directory is missing when creating a Unix socket path.
    #[error("socket path '{path}' has no parent directory")]
    MissingParent {
        /// Socket path without a parent.
        path: Utf8PathBuf,
    },
    /// Failed to create or adjust socket directories.
    #[error("failed to create socket directory '{path}': {source}")]
    CreateDirectory {
        /// Directory that could not be prepared.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: std::io::Error,
    },
}
