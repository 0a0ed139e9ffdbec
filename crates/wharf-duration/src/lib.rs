//! Duration parsing and serde codecs for wharf.
//!
//! Config and wire-format fields that carry a duration accept either a
//! human-readable string (`"500ms"`, `"30s"`) or a plain `u64` of
//! milliseconds, so `.wharf.toml` and JSON bodies can mix styles freely.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a `Duration` from either a humantime string or a `u64` of milliseconds.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => {
            parse_duration(&s).map_err(|e| serde::de::Error::custom(e.to_string()))
        }
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a `Duration` as milliseconds, so it roundtrips with [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Deserialize `Option<Duration>`, same rules as [`deserialize_duration`].
pub fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper {
        None,
        String(String),
        U64(u64),
    }

    match Option::<Helper>::deserialize(deserializer)? {
        None | Some(Helper::None) => Ok(None),
        Some(Helper::String(s)) => {
            parse_duration(&s).map(Some).map_err(|e| serde::de::Error::custom(e.to_string()))
        }
        Some(Helper::U64(ms)) => Ok(Some(Duration::from_millis(ms))),
    }
}

/// Error returned by [`parse_duration`].
#[derive(Debug, Clone)]
pub struct DurationParseError(String);

impl fmt::Display for DurationParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid duration: {}", self.0)
    }
}

impl std::error::Error for DurationParseError {}

/// Parse a humantime string (`"500ms"`, `"30s"`, `"2m"`) into a `Duration`.
pub fn parse_duration(s: &str) -> Result<Duration, DurationParseError> {
    humantime::parse_duration(s.trim()).map_err(|e| DurationParseError(e.to_string()))
}

/// Format a `Duration` as a humantime string, e.g. for log messages.
pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}
