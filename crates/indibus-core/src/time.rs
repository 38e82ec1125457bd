//! Protocol timestamps.
//!
//! Timestamps are UTC without a zone suffix, `YYYY-MM-DDTHH:MM:SS[.fff]`.

use chrono::{DateTime, NaiveDateTime, Utc};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Formats a UTC instant as a protocol timestamp.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Returns the current time as a protocol timestamp.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Parses a protocol timestamp. A trailing `Z` is tolerated.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim().trim_end_matches('Z');
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
