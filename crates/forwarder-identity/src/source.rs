//! Live identity material shared between refreshers and observers.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::IdentityError;
use crate::svid::{TrustBundle, X509Svid};

/// Anything that can hand out the workload's current identity.
///
/// Both accessors are synchronous because rustls resolvers and verifiers call
/// them in the middle of a handshake. Implementations must return the latest
/// material every time, never a snapshot captured at construction.
pub trait IdentitySource: Send + Sync + fmt::Debug {
    /// Current SVID of this workload.
    fn current_svid(&self) -> Result<Arc<X509Svid>, IdentityError>;

    /// Current trust bundle used to verify peers.
    fn current_bundle(&self) -> Result<Arc<TrustBundle>, IdentityError>;
}

impl<T> IdentitySource for Arc<T>
where
    T: IdentitySource + ?Sized,
{
    fn current_svid(&self) -> Result<Arc<X509Svid>, IdentityError> {
        (**self).current_svid()
    }

    fn current_bundle(&self) -> Result<Arc<TrustBundle>, IdentityError> {
        (**self).current_bundle()
    }
}

/// An SVID together with the bundle that verifies peers.
#[derive(Debug, Clone)]
pub struct IdentityMaterial {
    /// Workload SVID.
    pub svid: Arc<X509Svid>,
    /// Peer trust bundle.
    pub bundle: Arc<TrustBundle>,
}

impl IdentityMaterial {
    /// Pairs an SVID with its bundle.
    #[must_use]
    pub fn new(svid: X509Svid, bundle: TrustBundle) -> Self {
        Self {
            svid: Arc::new(svid),
            bundle: Arc::new(bundle),
        }
    }
}

/// Write half of a live identity. Publishing replaces the material for every
/// observer at once.
#[derive(Debug)]
pub struct IdentityPublisher {
    sender: watch::Sender<IdentityMaterial>,
}

impl IdentityPublisher {
    /// Replaces the current material.
    pub fn publish(&self, material: IdentityMaterial) {
        self.sender.send_replace(material);
    }
}

/// Read half of a live identity. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LiveIdentity {
    receiver: watch::Receiver<IdentityMaterial>,
}

impl LiveIdentity {
    /// Creates a live identity seeded with `initial`.
    #[must_use]
    pub fn new(initial: IdentityMaterial) -> (IdentityPublisher, Self) {
        let (sender, receiver) = watch::channel(initial);
        (IdentityPublisher { sender }, Self { receiver })
    }

    /// Current material.
    #[must_use]
    pub fn material(&self) -> IdentityMaterial {
        self.receiver.borrow().clone()
    }

    /// Returns a receiver that wakes whenever new material is published.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<IdentityMaterial> {
        self.receiver.clone()
    }
}

impl IdentitySource for LiveIdentity {
    fn current_svid(&self) -> Result<Arc<X509Svid>, IdentityError> {
        Ok(Arc::clone(&self.receiver.borrow().svid))
    }

    fn current_bundle(&self) -> Result<Arc<TrustBundle>, IdentityError> {
        Ok(Arc::clone(&self.receiver.borrow().bundle))
    }
}
