//! Workload identity for the forwarder.
//!
//! The forwarder authenticates itself and its peers with SPIFFE X.509 SVIDs.
//! This crate models the identity material, keeps a live copy of it that
//! background refreshes can rotate, and derives everything the process needs
//! from that live copy:
//!
//! - mutual-TLS client and server configurations whose certificates and trust
//!   anchors are resolved on every handshake, so rotation needs no rebuild;
//! - authorization predicates applied to the peer's SPIFFE ID;
//! - short-lived JWT tokens bound to the current SVID.

mod authorize;
mod error;
mod file_source;
mod source;
mod spiffe_id;
mod svid;
mod tls;
mod token;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use authorize::{
    AuthorizationError, AuthorizeAny, AuthorizeId, AuthorizeMemberOf, AuthorizeOneOf, Authorizer,
};
pub use error::IdentityError;
pub use file_source::{FileIdentitySource, IdentityPaths, load_material};
pub use source::{IdentityMaterial, IdentityPublisher, IdentitySource, LiveIdentity};
pub use spiffe_id::{SpiffeId, SpiffeIdError, TrustDomain};
pub use svid::{TrustBundle, X509Svid, spiffe_id_from_der};
pub use tls::{TlsError, mtls_client_config, mtls_server_config, peer_spiffe_id};
pub use token::{JwtTokenGenerator, Token, TokenClaims, TokenError, TokenGenerator};
