//! Runs the forwarder from bootstrap to exit status.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::info;

use crate::bootstrap::{BootstrapError, Collaborators, ConfigLoader, SystemConfigLoader, bootstrap_with};
use crate::health::{HealthReporter, StructuredHealthReporter};

const LAUNCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::launch");

/// Runs the forwarder using the production collaborators.
///
/// Returns once the forwarder has shut down. The exit status follows the
/// configured failure policy.
pub async fn run_forwarder() -> Result<ExitCode, BootstrapError> {
    run_forwarder_with(
        &SystemConfigLoader,
        Arc::new(StructuredHealthReporter::new()),
        Collaborators::production(),
    )
    .await
}

/// Runs the forwarder with injected collaborators.
pub async fn run_forwarder_with(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
    collaborators: Collaborators,
) -> Result<ExitCode, BootstrapError> {
    let forwarder = bootstrap_with(loader, reporter, collaborators).await?;
    let policy = forwarder.config().failure_policy();
    let scope = forwarder.scope().clone();
    let report = forwarder.run_until_shutdown().await;
    scope.bind(async {
        info!(
            target: LAUNCH_TARGET,
            reason = %report.reason(),
            failures = report.failures().len(),
            %policy,
            fatal = report.is_fatal(policy),
            "forwarder exiting"
        );
    })
    .await;
    Ok(report.exit_code(policy))
}
