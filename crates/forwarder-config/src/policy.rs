use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How the process treats a subsystem that fails after startup completed.
///
/// Both policies cancel the shared execution scope and wait for the dataplane
/// agent to shut down. They differ only in the exit status reported once the
/// drain is complete.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum FailurePolicy {
    /// Treat the failure as a shutdown request and exit successfully.
    #[default]
    Cancel,
    /// Exit with a failure status once shutdown has drained.
    Exit,
}

impl FailurePolicy {
    /// Returns true when an in-flight failure must produce a failing exit status.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Exit)
    }
}

/// Errors encountered while parsing a [`FailurePolicy`] from text.
pub type FailurePolicyParseError = strum::ParseError;
