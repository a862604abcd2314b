//! SPIFFE identifiers and trust domains.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

const SPIFFE_SCHEME: &str = "spiffe";

/// The trust domain component of a SPIFFE ID, such as `example.org`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Returns the trust domain name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for TrustDomain {
    type Err = SpiffeIdError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let name = input.strip_prefix("spiffe://").unwrap_or(input);
        if name.is_empty() {
            return Err(SpiffeIdError::EmptyTrustDomain);
        }
        let valid = name.chars().all(|ch| {
            ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '-' | '_')
        });
        if !valid {
            return Err(SpiffeIdError::InvalidTrustDomain(name.to_owned()));
        }
        Ok(Self(name.to_owned()))
    }
}

/// A parsed `spiffe://<trust-domain>/<path>` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: String,
}

impl SpiffeId {
    /// Builds an ID from a trust domain and an absolute path.
    ///
    /// An empty path names the trust domain itself.
    pub fn new(trust_domain: TrustDomain, path: &str) -> Result<Self, SpiffeIdError> {
        validate_path(path)?;
        Ok(Self {
            trust_domain,
            path: path.to_owned(),
        })
    }

    /// Trust domain the ID belongs to.
    #[must_use]
    pub const fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Path component, including its leading slash.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns true when the ID belongs to `trust_domain`.
    #[must_use]
    pub fn is_member_of(&self, trust_domain: &TrustDomain) -> bool {
        &self.trust_domain == trust_domain
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{SPIFFE_SCHEME}://{}{}", self.trust_domain, self.path)
    }
}

impl FromStr for SpiffeId {
    type Err = SpiffeIdError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(input).map_err(|source| SpiffeIdError::Url {
            input: input.to_owned(),
            source,
        })?;
        if url.scheme() != SPIFFE_SCHEME {
            return Err(SpiffeIdError::WrongScheme(url.scheme().to_owned()));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(SpiffeIdError::QueryOrFragment(input.to_owned()));
        }
        if url.port().is_some() || !url.username().is_empty() || url.password().is_some() {
            return Err(SpiffeIdError::Authority(input.to_owned()));
        }
        let host = url.host_str().unwrap_or_default();
        let trust_domain = host.parse::<TrustDomain>()?;
        Self::new(trust_domain, url.path())
    }
}

fn validate_path(path: &str) -> Result<(), SpiffeIdError> {
    if path.is_empty() {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(SpiffeIdError::InvalidPath(path.to_owned()));
    }
    let dot_segment = path
        .split('/')
        .skip(1)
        .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if dot_segment {
        return Err(SpiffeIdError::InvalidPath(path.to_owned()));
    }
    Ok(())
}

/// Reasons a string is not a valid SPIFFE ID.
#[derive(Debug, Error)]
pub enum SpiffeIdError {
    /// The input was not a URL.
    #[error("'{input}' is not a URL: {source}")]
    Url {
        /// Rejected input.
        input: String,
        /// Parser error.
        #[source]
        source: url::ParseError,
    },
    /// The scheme was not `spiffe`.
    #[error("expected the spiffe scheme, found '{0}'")]
    WrongScheme(String),
    /// The trust domain was missing.
    #[error("SPIFFE ID has an empty trust domain")]
    EmptyTrustDomain,
    /// The trust domain contained forbidden characters.
    #[error("invalid trust domain '{0}'")]
    InvalidTrustDomain(String),
    /// The path was not a sequence of non-empty segments.
    #[error("invalid SPIFFE ID path '{0}'")]
    InvalidPath(String),
    /// A query string or fragment was present.
    #[error("SPIFFE ID '{0}' must not carry a query or fragment")]
    QueryOrFragment(String),
    /// A port or user information was present.
    #[error("SPIFFE ID '{0}' must not carry a port or user info")]
    Authority(String),
}
