//! Termination signals that end the forwarder.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

/// A source of "please stop" notifications.
#[async_trait]
pub trait ShutdownSignal: Send + Sync {
    /// Completes when shutdown is requested.
    ///
    /// Returns an error when the signal source cannot be installed.
    async fn wait(&self) -> io::Result<()>;
}

/// Waits for `SIGINT`, `SIGTERM`, `SIGQUIT` or `SIGHUP`.
///
/// Listeners are registered on each call to [`ShutdownSignal::wait`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShutdownSignal;

#[async_trait]
impl ShutdownSignal for SystemShutdownSignal {
    #[cfg(unix)]
    async fn wait(&self) -> io::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let mut sighup = signal(SignalKind::hangup())?;

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
            _ = sigquit.recv() => {}
            _ = sighup.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn wait(&self) -> io::Result<()> {
        tokio::signal::ctrl_c().await
    }
}

/// Shutdown triggered programmatically, for embedders and tests.
#[derive(Debug, Clone)]
pub struct ManualShutdown {
    fired: Arc<watch::Sender<bool>>,
}

impl ManualShutdown {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (fired, _) = watch::channel(false);
        Self {
            fired: Arc::new(fired),
        }
    }

    /// Requests shutdown. Later calls have no further effect.
    pub fn trigger(&self) {
        self.fired.send_replace(true);
    }

    /// Whether [`ManualShutdown::trigger`] has been called.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.fired.borrow()
    }
}

impl Default for ManualShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShutdownSignal for ManualShutdown {
    async fn wait(&self) -> io::Result<()> {
        let mut fired = self.fired.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = fired.wait_for(|fired| *fired).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn manual_shutdown_releases_waiters() {
        let shutdown = ManualShutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        shutdown.trigger();
        waiter.await.expect("join").expect("wait succeeds");
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn waiting_after_trigger_returns_immediately() {
        let shutdown = ManualShutdown::new();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .expect("no wait")
            .expect("wait succeeds");
    }
}
