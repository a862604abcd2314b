//! Identity material read from files that an external agent rotates.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn};

use crate::error::IdentityError;
use crate::source::{IdentityMaterial, IdentityPublisher, IdentitySource, LiveIdentity};
use crate::svid::{TrustBundle, X509Svid};

const IDENTITY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::file_source");

/// Locations of the three identity files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPaths {
    /// PEM certificate chain, leaf first.
    pub svid: Utf8PathBuf,
    /// PEM private key for the leaf.
    pub key: Utf8PathBuf,
    /// PEM trust bundle.
    pub bundle: Utf8PathBuf,
}

impl IdentityPaths {
    /// Uses the conventional `svid.pem`, `svid_key.pem` and `bundle.pem`
    /// names inside `dir`.
    #[must_use]
    pub fn in_dir(dir: &Utf8Path) -> Self {
        Self {
            svid: dir.join("svid.pem"),
            key: dir.join("svid_key.pem"),
            bundle: dir.join("bundle.pem"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RawMaterial {
    svid: Vec<u8>,
    key: Vec<u8>,
    bundle: Vec<u8>,
}

impl RawMaterial {
    async fn read(paths: &IdentityPaths) -> Result<Self, IdentityError> {
        Ok(Self {
            svid: read(&paths.svid).await?,
            key: read(&paths.key).await?,
            bundle: read(&paths.bundle).await?,
        })
    }

    fn decode(&self) -> Result<IdentityMaterial, IdentityError> {
        let svid = X509Svid::from_pem(&self.svid, &self.key)?;
        let bundle = TrustBundle::from_pem(&self.bundle)?;
        Ok(IdentityMaterial::new(svid, bundle))
    }
}

async fn read(path: &Utf8Path) -> Result<Vec<u8>, IdentityError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Reads and decodes the identity files once.
pub async fn load_material(paths: &IdentityPaths) -> Result<IdentityMaterial, IdentityError> {
    RawMaterial::read(paths).await?.decode()
}

/// Identity source backed by files on disk.
///
/// [`FileIdentitySource::obtain`] loads the files once and fails if they are
/// missing or malformed. A background task then polls the files and publishes
/// changed material. Reload failures keep the last good material in place.
#[derive(Debug, Clone)]
pub struct FileIdentitySource {
    live: LiveIdentity,
    paths: IdentityPaths,
}

impl FileIdentitySource {
    /// Loads the identity from `dir` and starts refreshing it every `refresh`
    /// until `cancel` fires.
    pub async fn obtain(
        dir: &Utf8Path,
        refresh: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, IdentityError> {
        let paths = IdentityPaths::in_dir(dir);
        let raw = RawMaterial::read(&paths).await?;
        let material = raw.decode()?;
        info!(
            target: IDENTITY_TARGET,
            spiffe_id = %material.svid.spiffe_id(),
            dir = %dir,
            "identity loaded"
        );
        let (publisher, live) = LiveIdentity::new(material);
        let refresher = Refresher {
            paths: paths.clone(),
            publisher,
            last: raw,
        };
        tokio::spawn(refresher.run(refresh, cancel).with_current_subscriber());
        Ok(Self { live, paths })
    }

    /// Files this source reads.
    #[must_use]
    pub const fn paths(&self) -> &IdentityPaths {
        &self.paths
    }

    /// The live identity fed by the refresh task.
    #[must_use]
    pub fn live(&self) -> LiveIdentity {
        self.live.clone()
    }
}

impl IdentitySource for FileIdentitySource {
    fn current_svid(&self) -> Result<Arc<X509Svid>, IdentityError> {
        self.live.current_svid()
    }

    fn current_bundle(&self) -> Result<Arc<TrustBundle>, IdentityError> {
        self.live.current_bundle()
    }
}

struct Refresher {
    paths: IdentityPaths,
    publisher: IdentityPublisher,
    last: RawMaterial,
}

impl Refresher {
    async fn run(mut self, refresh: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(refresh);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.poll().await,
            }
        }
        debug!(target: IDENTITY_TARGET, "identity refresh stopped");
    }

    async fn poll(&mut self) {
        let raw = match RawMaterial::read(&self.paths).await {
            Ok(raw) => raw,
            Err(error) => {
                warn!(target: IDENTITY_TARGET, error = %error, "identity reload failed");
                return;
            }
        };
        if raw == self.last {
            return;
        }
        match raw.decode() {
            Ok(material) => {
                info!(
                    target: IDENTITY_TARGET,
                    spiffe_id = %material.svid.spiffe_id(),
                    "identity rotated"
                );
                self.publisher.publish(material);
                self.last = raw;
            }
            Err(error) => {
                warn!(
                    target: IDENTITY_TARGET,
                    error = %error,
                    "rotated identity rejected; keeping previous material"
                );
            }
        }
    }
}
