//! Phase 3: obtaining the workload identity.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use forwarder_config::Config;
use forwarder_identity::{FileIdentitySource, IdentityError, IdentitySource};

use crate::scope::Scope;

const IDENTITY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::identity");

/// Supplies the live identity every credential is derived from.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Obtains the initial SVID. Any refresh work must stop when `scope` is
    /// cancelled.
    async fn obtain(
        &self,
        scope: &Scope,
        config: &Config,
    ) -> Result<Arc<dyn IdentitySource>, IdentityError>;
}

/// Reads the SVID, key and bundle from `identity_dir` and polls them for
/// rotation every `identity_refresh`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileIdentityProvider;

#[async_trait]
impl IdentityProvider for FileIdentityProvider {
    async fn obtain(
        &self,
        scope: &Scope,
        config: &Config,
    ) -> Result<Arc<dyn IdentitySource>, IdentityError> {
        let source = FileIdentitySource::obtain(
            &config.identity_dir,
            config.identity_refresh.get(),
            scope.child_token(),
        )
        .await?;
        info!(
            target: IDENTITY_TARGET,
            refresh = ?config.identity_refresh.get(),
            "identity refresh armed"
        );
        Ok(Arc::new(source))
    }
}
