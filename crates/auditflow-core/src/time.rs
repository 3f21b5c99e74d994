// crates/auditflow-core/src/time.rs
// ============================================================================
// Module: Timestamps
// Description: RFC3339 wall-clock timestamp type used across audit records.
// Purpose: Provide a serde-friendly timestamp with a stable wire form.
// Dependencies: time
// ============================================================================

//! A serde-friendly wall-clock timestamp type with a stable RFC3339 wire
//! form, used across audit records.

use std::fmt;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de::Error as _;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// A wall-clock instant, serialized as an RFC3339 string.
///
/// # Invariants
/// - Always UTC on the wire; local offsets are normalized at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(OffsetDateTime);

impl Timestamp {
    /// Wraps an [`OffsetDateTime`], normalizing it to UTC.
    #[must_use]
    pub fn from_offset_date_time(value: OffsetDateTime) -> Self {
        Self(value.to_offset(time::UtcOffset::UTC))
    }

    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_offset_date_time(OffsetDateTime::now_utc())
    }

    /// Returns the underlying [`OffsetDateTime`].
    #[must_use]
    pub const fn as_offset_date_time(self) -> OffsetDateTime {
        self.0
    }

    /// Parses an RFC3339-formatted timestamp string.
    ///
    /// # Errors
    ///
    /// Returns an error when `value` is not valid RFC3339.
    pub fn parse(value: &str) -> Result<Self, time::error::Parse> {
        OffsetDateTime::parse(value, &Rfc3339).map(Self::from_offset_date_time)
    }

    /// Formats the timestamp as an RFC3339 string.
    ///
    /// # Errors
    ///
    /// Returns an error when formatting fails (practically infallible for
    /// UTC-normalized instants within the supported year range).
    pub fn to_rfc3339(self) -> Result<String, time::error::Format> {
        self.0.format(&Rfc3339)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_rfc3339() {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = self.to_rfc3339().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_rfc3339() {
        let ts = Timestamp::parse("2026-01-02T03:04:05Z").unwrap();
        assert_eq!(ts.to_rfc3339().unwrap(), "2026-01-02T03:04:05Z");
    }

    #[test]
    fn ordering_matches_chronology() {
        let earlier = Timestamp::parse("2026-01-01T00:00:00Z").unwrap();
        let later = Timestamp::parse("2026-01-02T00:00:00Z").unwrap();
        assert!(earlier < later);
    }
}
