//! Timestamp storage and display formats.
//!
//! Stored timestamps are RFC 3339 UTC with fixed microsecond precision, so
//! string order equals chronological order. Clients receive timestamps
//! rendered in one fixed offset, `YYYY-MM-DD hh:mm:ss AM (LABEL)`.

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};

const DISPLAY_FORMAT: &str = "%Y-%m-%d %I:%M:%S %p";

/// Renders `created_at` for delivered payloads and history responses.
#[derive(Debug, Clone)]
pub struct DisplayClock {
    offset: FixedOffset,
    label: String,
}

impl DisplayClock {
    /// Returns `None` when the offset is out of range (more than a day).
    pub fn new(utc_offset_minutes: i32, label: impl Into<String>) -> Option<Self> {
        let offset = FixedOffset::east_opt(utc_offset_minutes.checked_mul(60)?)?;
        Some(Self {
            offset,
            label: label.into(),
        })
    }

    pub fn render(&self, at: DateTime<Utc>) -> String {
        format!(
            "{} ({})",
            at.with_timezone(&self.offset).format(DISPLAY_FORMAT),
            self.label
        )
    }
}

pub fn to_stored(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_stored(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|at| at.with_timezone(&Utc))
}
