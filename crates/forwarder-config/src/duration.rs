use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A [`Duration`] written in human-readable form, such as `24h` or `500ms`.
///
/// Bare integers are accepted as a number of seconds because environment
/// layers often hand numeric strings over as numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HumanDuration(Duration);

impl HumanDuration {
    /// Wraps an existing duration.
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// Builds a duration from whole seconds.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Returns the wrapped duration.
    #[must_use]
    pub const fn get(self) -> Duration {
        self.0
    }

    /// Returns true for a zero-length duration.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for HumanDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl From<HumanDuration> for Duration {
    fn from(value: HumanDuration) -> Self {
        value.0
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", humantime::format_duration(self.0))
    }
}

impl FromStr for HumanDuration {
    type Err = humantime::DurationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if let Ok(secs) = trimmed.parse::<u64>() {
            return Ok(Self::from_secs(secs));
        }
        humantime::parse_duration(trimmed).map(Self)
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Seconds(u64),
    Text(String),
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match DurationRepr::deserialize(deserializer)? {
            DurationRepr::Seconds(secs) => Ok(Self::from_secs(secs)),
            DurationRepr::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("24h", Duration::from_secs(24 * 60 * 60))]
    #[case("500ms", Duration::from_millis(500))]
    #[case("1h 30m", Duration::from_secs(90 * 60))]
    #[case("30", Duration::from_secs(30))]
    fn parses_human_durations(#[case] input: &str, #[case] expected: Duration) {
        let parsed: HumanDuration = input.parse().unwrap();
        assert_eq!(parsed.get(), expected);
    }

    #[test]
    fn rejects_unknown_units() {
        assert!("3 fortnights".parse::<HumanDuration>().is_err());
    }

    #[test]
    fn deserialises_numbers_as_seconds() {
        let parsed: HumanDuration = serde_json::from_str("90").unwrap();
        assert_eq!(parsed.get(), Duration::from_secs(90));
    }

    #[test]
    fn displays_in_humantime_syntax() {
        assert_eq!(HumanDuration::from_secs(24 * 60 * 60).to_string(), "1day");
    }
}
