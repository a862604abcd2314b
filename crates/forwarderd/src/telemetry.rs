//! Structured telemetry for the forwarder.
//!
//! Subscribers are built as [`Dispatch`] handles rather than installed as the
//! process-wide default. The scope attaches its dispatcher to every task it
//! spawns, so several forwarders can run in one process (as the tests do)
//! without fighting over global state.

use std::io::{self, IsTerminal};

use tracing::{Dispatch, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use forwarder_config::{Config, LogFormat, default_log_filter};

/// Dispatcher the forwarder logs through.
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    dispatch: Dispatch,
}

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
}

impl TelemetryHandle {
    /// Discards every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            dispatch: Dispatch::none(),
        }
    }

    /// Compact logging at the default level, used until configuration loads.
    #[must_use]
    pub fn early() -> Self {
        let filter = EnvFilter::new(default_log_filter());
        Self {
            dispatch: Dispatch::new(build(filter, LogFormat::Compact)),
        }
    }

    /// The underlying dispatcher.
    #[must_use]
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }
}

/// Builds the dispatcher described by `config`.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    let filter = EnvFilter::try_new(config.log_filter())
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;
    Ok(TelemetryHandle {
        dispatch: Dispatch::new(build(filter, config.log_format())),
    })
}

fn build(filter: EnvFilter, format: LogFormat) -> Box<dyn Subscriber + Send + Sync> {
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_timer(fmt::time::UtcTime::rfc_3339());

    match format {
        LogFormat::Json => Box::new(builder.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    }
}
