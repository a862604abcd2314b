//! X.509 SVIDs and trust bundles.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::error::IdentityError;
use crate::spiffe_id::SpiffeId;
use crate::tls::crypto_provider;

/// A workload's X.509 SVID: certificate chain, private key and SPIFFE ID.
pub struct X509Svid {
    id: SpiffeId,
    leaf: CertificateDer<'static>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    certified: Arc<CertifiedKey>,
    expires_at: SystemTime,
}

impl X509Svid {
    /// Decodes an SVID from a PEM certificate chain and a PEM private key.
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, IdentityError> {
        let chain = CertificateDer::pem_slice_iter(chain_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| IdentityError::Pem {
                what: "certificate chain",
                source,
            })?;
        let key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|source| IdentityError::Pem {
            what: "private key",
            source,
        })?;
        Self::from_der(chain, key)
    }

    /// Builds an SVID from DER values, leaf certificate first.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, IdentityError> {
        let leaf = chain.first().cloned().ok_or(IdentityError::EmptyChain)?;
        let id = spiffe_id_from_der(&leaf)?;
        let expires_at = not_after(&leaf)?;
        let signing_key = crypto_provider()
            .key_provider
            .load_private_key(key.clone_key())
            .map_err(|source| IdentityError::Key { source })?;
        let certified = Arc::new(CertifiedKey::new(chain.clone(), signing_key));
        Ok(Self {
            id,
            leaf,
            chain,
            key,
            certified,
            expires_at,
        })
    }

    /// SPIFFE ID carried by the leaf certificate.
    #[must_use]
    pub const fn spiffe_id(&self) -> &SpiffeId {
        &self.id
    }

    /// Leaf certificate.
    #[must_use]
    pub const fn leaf(&self) -> &CertificateDer<'static> {
        &self.leaf
    }

    /// Full chain, leaf first.
    #[must_use]
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Private key matching the leaf certificate.
    #[must_use]
    pub const fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    /// Certificate and signing key in the form rustls resolvers hand out.
    #[must_use]
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }

    /// Expiry of the leaf certificate.
    #[must_use]
    pub const fn expires_at(&self) -> SystemTime {
        self.expires_at
    }
}

impl fmt::Debug for X509Svid {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("X509Svid")
            .field("id", &self.id)
            .field("chain_len", &self.chain.len())
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Root certificates trusted for peer verification.
#[derive(Debug, Clone)]
pub struct TrustBundle {
    roots: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    /// Decodes a bundle from concatenated PEM certificates.
    pub fn from_pem(pem: &[u8]) -> Result<Self, IdentityError> {
        let roots = CertificateDer::pem_slice_iter(pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| IdentityError::Pem {
                what: "trust bundle",
                source,
            })?;
        Self::new(roots)
    }

    /// Builds a bundle from DER roots.
    pub fn new(roots: Vec<CertificateDer<'static>>) -> Result<Self, IdentityError> {
        if roots.is_empty() {
            return Err(IdentityError::EmptyBundle);
        }
        Ok(Self { roots })
    }

    /// Trusted root certificates.
    #[must_use]
    pub fn roots(&self) -> &[CertificateDer<'static>] {
        &self.roots
    }
}

/// Extracts the SPIFFE ID from the URI SAN of a DER certificate.
pub fn spiffe_id_from_der(cert: &CertificateDer<'_>) -> Result<SpiffeId, IdentityError> {
    let parsed = parse(cert)?;
    let san = parsed
        .subject_alternative_name()
        .map_err(|error| IdentityError::Certificate {
            message: error.to_string(),
        })?
        .ok_or(IdentityError::MissingSpiffeId)?;
    let uri = san
        .value
        .general_names
        .iter()
        .find_map(|name| match name {
            GeneralName::URI(uri) => Some(*uri),
            _ => None,
        })
        .ok_or(IdentityError::MissingSpiffeId)?;
    uri.parse()
        .map_err(|source| IdentityError::InvalidSpiffeId { source })
}

fn not_after(cert: &CertificateDer<'_>) -> Result<SystemTime, IdentityError> {
    let parsed = parse(cert)?;
    let secs = u64::try_from(parsed.validity().not_after.timestamp()).unwrap_or_default();
    Ok(UNIX_EPOCH + Duration::from_secs(secs))
}

fn parse<'a>(cert: &'a CertificateDer<'_>) -> Result<X509Certificate<'a>, IdentityError> {
    X509Certificate::from_der(cert.as_ref())
        .map(|(_, parsed)| parsed)
        .map_err(|error| IdentityError::Certificate {
            message: error.to_string(),
        })
}
