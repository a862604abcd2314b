//! In-memory certificate authority for tests.
//!
//! [`TestPki`] issues SPIFFE SVIDs signed by a throwaway CA so tests can build
//! real TLS sessions and JWTs without touching an identity provider.
#![expect(
    clippy::expect_used,
    reason = "test fixtures fail fast when certificate generation breaks"
)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, Ia5String,
    IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::CertificateDer;

use crate::source::{IdentityMaterial, IdentityPublisher, LiveIdentity};
use crate::svid::{TrustBundle, X509Svid};

/// A certificate and key issued by [`TestPki`].
#[derive(Debug, Clone)]
pub struct IssuedSvid {
    /// PEM leaf certificate.
    pub cert_pem: String,
    /// PEM PKCS#8 private key.
    pub key_pem: String,
    /// DER leaf certificate.
    pub cert: CertificateDer<'static>,
    /// Uncompressed public key point, as JWT verifiers expect it.
    pub public_key_raw: Vec<u8>,
}

impl IssuedSvid {
    /// DER leaf certificate.
    #[must_use]
    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.clone()
    }

    /// Decodes the issued material as an SVID.
    #[must_use]
    pub fn svid(&self) -> X509Svid {
        X509Svid::from_pem(self.cert_pem.as_bytes(), self.key_pem.as_bytes())
            .expect("issued SVID decodes")
    }
}

static CA_SERIAL: AtomicU64 = AtomicU64::new(1);

/// A throwaway certificate authority for one trust domain.
///
/// Every instance carries a distinct subject, so chains from one instance
/// never resolve against another.
pub struct TestPki {
    trust_domain: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl TestPki {
    /// Creates a CA for `trust_domain`.
    #[must_use]
    pub fn new(trust_domain: &str) -> Self {
        let serial = CA_SERIAL.fetch_add(1, Ordering::Relaxed);
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{trust_domain} test CA {serial}"));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_key = KeyPair::generate().expect("CA key generation");
        let ca_cert = params.self_signed(&ca_key).expect("CA self-signing");
        Self {
            trust_domain: trust_domain.to_owned(),
            ca_cert,
            ca_key,
        }
    }

    /// PEM encoding of the CA certificate, usable as a trust bundle.
    #[must_use]
    pub fn bundle_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// The CA as a trust bundle.
    #[must_use]
    pub fn bundle(&self) -> TrustBundle {
        TrustBundle::new(vec![self.ca_cert.der().clone()]).expect("bundle has one root")
    }

    /// Issues an SVID for `spiffe://<trust-domain><path>`.
    #[must_use]
    pub fn issue(&self, path: &str) -> IssuedSvid {
        self.issue_with(Some(path), None)
    }

    /// Issues an SVID that expires on 1 January of `year`.
    #[must_use]
    pub fn issue_until(&self, path: &str, year: i32) -> IssuedSvid {
        self.issue_with(Some(path), Some(year))
    }

    /// Issues a certificate with no URI SAN.
    #[must_use]
    pub fn issue_without_spiffe_id(&self) -> IssuedSvid {
        self.issue_with(None, None)
    }

    /// Issues an SVID for `path` and pairs it with this CA's bundle.
    #[must_use]
    pub fn material(&self, path: &str) -> IdentityMaterial {
        self.material_for(&self.issue(path))
    }

    /// Pairs an issued SVID with this CA's bundle.
    #[must_use]
    pub fn material_for(&self, issued: &IssuedSvid) -> IdentityMaterial {
        IdentityMaterial::new(issued.svid(), self.bundle())
    }

    /// Creates a live identity seeded with an SVID for `path`.
    #[must_use]
    pub fn live(&self, path: &str) -> (IdentityPublisher, LiveIdentity) {
        LiveIdentity::new(self.material(path))
    }

    /// Writes `svid.pem`, `svid_key.pem` and `bundle.pem` into `dir`.
    pub fn write_identity(&self, dir: &Path, issued: &IssuedSvid) {
        fs::write(dir.join("svid.pem"), &issued.cert_pem).expect("write svid.pem");
        fs::write(dir.join("svid_key.pem"), &issued.key_pem).expect("write svid_key.pem");
        fs::write(dir.join("bundle.pem"), self.bundle_pem()).expect("write bundle.pem");
    }

    fn issue_with(&self, path: Option<&str>, expiry_year: Option<i32>) -> IssuedSvid {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "forwarder test workload");
        if let Some(path) = path {
            let uri = format!("spiffe://{}{path}", self.trust_domain);
            params.subject_alt_names = vec![SanType::URI(
                Ia5String::try_from(uri.as_str()).expect("SPIFFE ID is IA5"),
            )];
        }
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        if let Some(year) = expiry_year {
            params.not_after = rcgen::date_time_ymd(year, 1, 1);
        }
        let key = KeyPair::generate().expect("leaf key generation");
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .expect("leaf signing");
        IssuedSvid {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert: cert.der().clone(),
            public_key_raw: key.public_key_raw().to_vec(),
        }
    }
}
