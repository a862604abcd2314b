//! Authorization predicates over peer SPIFFE IDs.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::spiffe_id::{SpiffeId, TrustDomain};

/// Decides whether an authenticated peer may talk to us.
///
/// Authorizers run after the peer's certificate chain has been verified, so
/// they only see identities the trust bundle vouches for.
pub trait Authorizer: Send + Sync + fmt::Debug {
    /// Accepts or rejects `peer`.
    fn authorize(&self, peer: &SpiffeId) -> Result<(), AuthorizationError>;
}

/// Rejection reasons.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    /// The peer is not the one expected.
    #[error("peer {peer} is not {expected}")]
    UnexpectedPeer {
        /// Peer presented in the handshake.
        peer: String,
        /// Identity required by policy.
        expected: String,
    },
    /// The peer is not in the allowed set.
    #[error("peer {peer} is not in the allowed set")]
    NotAllowed {
        /// Peer presented in the handshake.
        peer: String,
    },
    /// The peer belongs to another trust domain.
    #[error("peer {peer} is not a member of {trust_domain}")]
    ForeignTrustDomain {
        /// Peer presented in the handshake.
        peer: String,
        /// Trust domain required by policy.
        trust_domain: String,
    },
}

/// Accepts every verified peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthorizeAny;

impl Authorizer for AuthorizeAny {
    fn authorize(&self, _peer: &SpiffeId) -> Result<(), AuthorizationError> {
        Ok(())
    }
}

/// Accepts exactly one peer.
#[derive(Debug, Clone)]
pub struct AuthorizeId(pub SpiffeId);

impl Authorizer for AuthorizeId {
    fn authorize(&self, peer: &SpiffeId) -> Result<(), AuthorizationError> {
        if peer == &self.0 {
            Ok(())
        } else {
            Err(AuthorizationError::UnexpectedPeer {
                peer: peer.to_string(),
                expected: self.0.to_string(),
            })
        }
    }
}

/// Accepts any peer in a fixed set.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOneOf(BTreeSet<SpiffeId>);

impl AuthorizeOneOf {
    /// Builds the predicate from the allowed IDs.
    pub fn new(allowed: impl IntoIterator<Item = SpiffeId>) -> Self {
        Self(allowed.into_iter().collect())
    }
}

impl Authorizer for AuthorizeOneOf {
    fn authorize(&self, peer: &SpiffeId) -> Result<(), AuthorizationError> {
        if self.0.contains(peer) {
            Ok(())
        } else {
            Err(AuthorizationError::NotAllowed {
                peer: peer.to_string(),
            })
        }
    }
}

/// Accepts any peer from one trust domain.
#[derive(Debug, Clone)]
pub struct AuthorizeMemberOf(pub TrustDomain);

impl Authorizer for AuthorizeMemberOf {
    fn authorize(&self, peer: &SpiffeId) -> Result<(), AuthorizationError> {
        if peer.is_member_of(&self.0) {
            Ok(())
        } else {
            Err(AuthorizationError::ForeignTrustDomain {
                peer: peer.to_string(),
                trust_domain: self.0.to_string(),
            })
        }
    }
}
