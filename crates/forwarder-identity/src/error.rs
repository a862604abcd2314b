use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::spiffe_id::SpiffeIdError;

/// Errors raised while loading or querying identity material.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// An identity file could not be read.
    #[error("failed to read identity file '{path}': {source}")]
    Read {
        /// File that failed.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// PEM content could not be decoded.
    #[error("failed to decode {what} PEM: {source}")]
    Pem {
        /// Which object was being decoded.
        what: &'static str,
        /// Decoder error.
        #[source]
        source: rustls::pki_types::pem::Error,
    },
    /// The SVID carried no certificates.
    #[error("SVID certificate chain is empty")]
    EmptyChain,
    /// The trust bundle carried no roots.
    #[error("trust bundle contains no certificates")]
    EmptyBundle,
    /// A certificate could not be parsed as X.509.
    #[error("malformed X.509 certificate: {message}")]
    Certificate {
        /// Parser diagnostic.
        message: String,
    },
    /// The leaf certificate has no URI SAN.
    #[error("certificate carries no SPIFFE ID URI SAN")]
    MissingSpiffeId,
    /// The URI SAN is not a valid SPIFFE ID.
    #[error("certificate carries an invalid SPIFFE ID: {source}")]
    InvalidSpiffeId {
        /// Parse failure.
        #[source]
        source: SpiffeIdError,
    },
    /// The private key is not usable for signing.
    #[error("unsupported SVID private key: {source}")]
    Key {
        /// rustls diagnostic.
        #[source]
        source: rustls::Error,
    },
    /// The source has no material to hand out.
    #[error("identity material unavailable: {message}")]
    Unavailable {
        /// Why the material is unavailable.
        message: String,
    },
}
