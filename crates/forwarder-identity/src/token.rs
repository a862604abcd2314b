//! Per-request tokens signed with the workload's SVID key.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rustls::SignatureAlgorithm;
use rustls::pki_types::PrivateKeyDer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::IdentityError;
use crate::source::IdentitySource;
use crate::spiffe_id::SpiffeId;
use crate::svid::X509Svid;

/// A signed token and the instant it stops being valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Compact JWS encoding.
    pub value: String,
    /// Expiry carried in the `exp` claim.
    pub expires_at: SystemTime,
}

/// Claims carried by issued tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// SPIFFE ID of the issuing workload.
    pub sub: String,
    /// SPIFFE ID of the peer the token is meant for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Issue time, seconds since the Unix epoch.
    pub iat: u64,
    /// Expiry time, seconds since the Unix epoch.
    pub exp: u64,
}

/// Failures while issuing a token.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The identity source had no SVID.
    #[error("no identity to sign the token with: {source}")]
    Identity {
        /// Identity failure.
        #[source]
        source: IdentityError,
    },
    /// The SVID has already expired.
    #[error("SVID for {spiffe_id} has expired")]
    Expired {
        /// Expired identity.
        spiffe_id: String,
    },
    /// The SVID key type cannot sign JWTs.
    #[error("SVID key cannot sign tokens: {reason}")]
    UnsupportedKey {
        /// Why the key was refused.
        reason: &'static str,
    },
    /// Signing failed.
    #[error("failed to sign token: {source}")]
    Sign {
        /// Encoder error.
        #[source]
        source: jsonwebtoken::errors::Error,
    },
}

/// Issues tokens that the endpoint chain stamps into path segments.
pub trait TokenGenerator: Send + Sync + fmt::Debug {
    /// Issues a token, addressed to `peer` when known.
    fn generate(&self, peer: Option<&SpiffeId>) -> Result<Token, TokenError>;
}

/// JWT generator bound to the live SVID.
///
/// Each token is signed with the SVID's private key at the time of the call.
/// Its lifetime is the configured maximum, cut short to the SVID's own
/// expiry so a token never outlives the certificate that vouches for it.
#[derive(Debug, Clone)]
pub struct JwtTokenGenerator {
    source: Arc<dyn IdentitySource>,
    max_lifetime: Duration,
}

impl JwtTokenGenerator {
    /// Builds a generator over `source` with the given lifetime bound.
    #[must_use]
    pub fn new(source: Arc<dyn IdentitySource>, max_lifetime: Duration) -> Self {
        Self {
            source,
            max_lifetime,
        }
    }

    /// Lifetime bound applied to every token.
    #[must_use]
    pub const fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }

    fn issue_at(&self, now: SystemTime, peer: Option<&SpiffeId>) -> Result<Token, TokenError> {
        let svid = self
            .source
            .current_svid()
            .map_err(|source| TokenError::Identity { source })?;
        if svid.expires_at() <= now {
            return Err(TokenError::Expired {
                spiffe_id: svid.spiffe_id().to_string(),
            });
        }
        let expires_at = (now + self.max_lifetime).min(svid.expires_at());
        let claims = TokenClaims {
            sub: svid.spiffe_id().to_string(),
            aud: peer.map(ToString::to_string),
            iat: unix_secs(now),
            exp: unix_secs(expires_at),
        };
        let (algorithm, key) = signing_key(&svid)?;
        let value = jsonwebtoken::encode(&Header::new(algorithm), &claims, &key)
            .map_err(|source| TokenError::Sign { source })?;
        Ok(Token {
            value,
            expires_at: UNIX_EPOCH + Duration::from_secs(claims.exp),
        })
    }
}

impl TokenGenerator for JwtTokenGenerator {
    fn generate(&self, peer: Option<&SpiffeId>) -> Result<Token, TokenError> {
        self.issue_at(SystemTime::now(), peer)
    }
}

fn signing_key(svid: &X509Svid) -> Result<(Algorithm, EncodingKey), TokenError> {
    let algorithm = svid.certified_key().key.algorithm();
    match (algorithm, svid.private_key()) {
        (SignatureAlgorithm::ECDSA, PrivateKeyDer::Pkcs8(der)) => Ok((
            Algorithm::ES256,
            EncodingKey::from_ec_der(der.secret_pkcs8_der()),
        )),
        (SignatureAlgorithm::ED25519, PrivateKeyDer::Pkcs8(der)) => Ok((
            Algorithm::EdDSA,
            EncodingKey::from_ed_der(der.secret_pkcs8_der()),
        )),
        (SignatureAlgorithm::RSA, PrivateKeyDer::Pkcs1(der)) => Ok((
            Algorithm::RS256,
            EncodingKey::from_rsa_der(der.secret_pkcs1_der()),
        )),
        (SignatureAlgorithm::ECDSA | SignatureAlgorithm::ED25519, _) => {
            Err(TokenError::UnsupportedKey {
                reason: "elliptic curve keys must be PKCS#8 encoded",
            })
        }
        (SignatureAlgorithm::RSA, _) => Err(TokenError::UnsupportedKey {
            reason: "RSA keys must be PKCS#1 encoded",
        }),
        _ => Err(TokenError::UnsupportedKey {
            reason: "unsupported signature algorithm",
        }),
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
