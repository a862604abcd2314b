//! Mutual-TLS configurations derived from a live identity source.
//!
//! Neither configuration captures certificates at build time. The resolvers
//! ask the [`IdentitySource`] for the current SVID on every handshake and the
//! verifiers ask it for the current bundle, so a rotated identity takes effect
//! on the next connection without rebuilding anything.
//!
//! Peers are authenticated the SPIFFE way: the chain must verify against the
//! bundle and carry the right extended key usage, the server name is ignored,
//! and the SPIFFE ID in the leaf's URI SAN is handed to an [`Authorizer`].

use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, OtherError,
    ServerConfig, SignatureScheme,
};
use thiserror::Error;
use tracing::warn;

use crate::authorize::Authorizer;
use crate::error::IdentityError;
use crate::source::IdentitySource;
use crate::spiffe_id::SpiffeId;
use crate::svid::spiffe_id_from_der;

const TLS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::tls");

static PROVIDER: Lazy<Arc<CryptoProvider>> =
    Lazy::new(|| Arc::new(rustls::crypto::ring::default_provider()));

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::clone(&PROVIDER)
}

/// Errors raised while assembling TLS configurations.
#[derive(Debug, Error)]
pub enum TlsError {
    /// rustls rejected the configuration.
    #[error("failed to build TLS configuration: {source}")]
    Config {
        /// rustls diagnostic.
        #[source]
        source: rustls::Error,
    },
}

/// Builds client-role credentials: present the current SVID, verify the server
/// against the current bundle and `authorizer`.
pub fn mtls_client_config(
    source: Arc<dyn IdentitySource>,
    authorizer: Arc<dyn Authorizer>,
) -> Result<ClientConfig, TlsError> {
    let verifier = SpiffePeerVerifier::new(Arc::clone(&source), authorizer);
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|source| TlsError::Config { source })?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_cert_resolver(Arc::new(LiveCertResolver { source }));
    Ok(config)
}

/// Builds server-role credentials: present the current SVID, require a client
/// certificate that verifies against the current bundle and `authorizer`.
pub fn mtls_server_config(
    source: Arc<dyn IdentitySource>,
    authorizer: Arc<dyn Authorizer>,
) -> Result<ServerConfig, TlsError> {
    let verifier = SpiffePeerVerifier::new(Arc::clone(&source), authorizer);
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|source| TlsError::Config { source })?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_cert_resolver(Arc::new(LiveCertResolver { source }));
    Ok(config)
}

/// SPIFFE ID of the peer at the far end of an established session.
#[must_use]
pub fn peer_spiffe_id(peer_certificates: Option<&[CertificateDer<'static>]>) -> Option<SpiffeId> {
    let leaf = peer_certificates?.first()?;
    spiffe_id_from_der(leaf).ok()
}

#[derive(Debug)]
struct LiveCertResolver {
    source: Arc<dyn IdentitySource>,
}

impl LiveCertResolver {
    fn current(&self) -> Option<Arc<CertifiedKey>> {
        match self.source.current_svid() {
            Ok(svid) => Some(svid.certified_key()),
            Err(error) => {
                warn!(target: TLS_TARGET, error = %error, "no SVID available for handshake");
                None
            }
        }
    }
}

impl ResolvesClientCert for LiveCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.current()
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl ResolvesServerCert for LiveCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current()
    }
}

#[derive(Debug)]
struct SpiffePeerVerifier {
    source: Arc<dyn IdentitySource>,
    authorizer: Arc<dyn Authorizer>,
    provider: Arc<CryptoProvider>,
}

impl SpiffePeerVerifier {
    fn new(source: Arc<dyn IdentitySource>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            source,
            authorizer,
            provider: crypto_provider(),
        }
    }

    fn verify_peer(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
        usage: webpki::KeyUsage,
    ) -> Result<SpiffeId, rustls::Error> {
        let bundle = self.source.current_bundle().map_err(identity_error)?;
        let anchors = bundle
            .roots()
            .iter()
            .map(webpki::anchor_from_trusted_cert)
            .collect::<Result<Vec<_>, _>>()
            .map_err(pki_error)?;
        let cert = webpki::EndEntityCert::try_from(end_entity).map_err(pki_error)?;
        cert.verify_for_usage(
            self.provider.signature_verification_algorithms.all,
            &anchors,
            intermediates,
            now,
            usage,
            None,
            None,
        )
        .map_err(pki_error)?;

        let peer = spiffe_id_from_der(end_entity).map_err(identity_error)?;
        self.authorizer
            .authorize(&peer)
            .map_err(other_error)?;
        Ok(peer)
    }
}

impl ServerCertVerifier for SpiffePeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.verify_peer(end_entity, intermediates, now, webpki::KeyUsage::server_auth())?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ClientCertVerifier for SpiffePeerVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.verify_peer(end_entity, intermediates, now, webpki::KeyUsage::client_auth())?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn other_error<E>(error: E) -> rustls::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(error))))
}

fn identity_error(error: IdentityError) -> rustls::Error {
    other_error(error)
}

fn pki_error(error: webpki::Error) -> rustls::Error {
    match error {
        webpki::Error::CertExpired { .. } => {
            rustls::Error::InvalidCertificate(CertificateError::Expired)
        }
        webpki::Error::CertNotValidYet { .. } => {
            rustls::Error::InvalidCertificate(CertificateError::NotValidYet)
        }
        webpki::Error::UnknownIssuer => {
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)
        }
        webpki::Error::InvalidSignatureForPublicKey => {
            rustls::Error::InvalidCertificate(CertificateError::BadSignature)
        }
        other => other_error(other),
    }
}

#[cfg(test)]
mod tests {
    use crate::authorize::{AuthorizeAny, AuthorizeId};
    use crate::source::LiveIdentity;
    use crate::test_support::TestPki;

    use super::*;

    fn source(pki: &TestPki, path: &str) -> Arc<dyn IdentitySource> {
        let (publisher, live) = LiveIdentity::new(pki.material(path));
        drop(publisher);
        Arc::new(live)
    }

    #[test]
    fn builds_both_roles_from_one_source() {
        let pki = TestPki::new("example.org");
        let identity = source(&pki, "/forwarder");
        let authorizer: Arc<dyn Authorizer> = Arc::new(AuthorizeAny);

        let client = mtls_client_config(Arc::clone(&identity), Arc::clone(&authorizer))
            .expect("client config");
        let server = mtls_server_config(identity, authorizer).expect("server config");

        assert!(client.client_auth_cert_resolver.has_certs());
        assert!(server.alpn_protocols.is_empty());
    }

    #[test]
    fn verifier_accepts_peers_from_the_bundle() {
        let pki = TestPki::new("example.org");
        let peer = pki.issue("/nsmgr");
        let verifier = SpiffePeerVerifier::new(source(&pki, "/forwarder"), Arc::new(AuthorizeAny));

        let id = verifier
            .verify_peer(
                &peer.cert_der(),
                &[],
                UnixTime::now(),
                webpki::KeyUsage::client_auth(),
            )
            .expect("peer verifies");
        assert_eq!(id.path(), "/nsmgr");
    }

    #[test]
    fn verifier_rejects_peers_from_another_authority() {
        let pki = TestPki::new("example.org");
        let stranger = TestPki::new("example.org").issue("/nsmgr");
        let verifier = SpiffePeerVerifier::new(source(&pki, "/forwarder"), Arc::new(AuthorizeAny));

        let error = verifier
            .verify_peer(
                &stranger.cert_der(),
                &[],
                UnixTime::now(),
                webpki::KeyUsage::server_auth(),
            )
            .expect_err("stranger must be rejected");
        assert_eq!(
            error,
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)
        );
    }

    #[test]
    fn verifier_applies_the_authorizer() {
        let pki = TestPki::new("example.org");
        let peer = pki.issue("/intruder");
        let expected: SpiffeId = "spiffe://example.org/nsmgr".parse().expect("valid id");
        let verifier =
            SpiffePeerVerifier::new(source(&pki, "/forwarder"), Arc::new(AuthorizeId(expected)));

        let result = verifier.verify_peer(
            &peer.cert_der(),
            &[],
            UnixTime::now(),
            webpki::KeyUsage::server_auth(),
        );
        assert!(result.is_err(), "unauthorized peer accepted");
    }
}
