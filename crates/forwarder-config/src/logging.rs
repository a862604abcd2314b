use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Output encodings supported by the forwarder's log sink.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per line, for log collectors.
    #[default]
    Json,
    /// Single-line text for operators reading a terminal.
    Compact,
}

/// Errors encountered while parsing a [`LogFormat`] from text.
pub type LogFormatParseError = strum::ParseError;
