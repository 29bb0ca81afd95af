//! Conversions between the datetime formats used across the archive.
//!
//! Three representations show up on the wire and on disk:
//!
//! - HTTP dates (`Mon, 27 Jan 2014 17:12:51 GMT`) in `Memento-Datetime`,
//!   `Link` and `Accept-Datetime` headers
//! - 14-digit archive timestamps (`20140127171251`) in the index and head insert
//! - ISO-8601 (`2014-01-27T17:12:51Z`) in `WARC-Date`

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};

use crate::error::TimestampError;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";
const TIMESTAMP14_FORMAT: &str = "%Y%m%d%H%M%S";
const WARC_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Current time truncated to whole seconds.
///
/// Captures are stored with second precision, so anything recorded must be
/// truncated up front for the 14-digit form to round-trip.
pub fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Formats a datetime as an RFC 1123 HTTP date.
pub fn format_http_date(dt: &DateTime<Utc>) -> String {
    dt.format(HTTP_DATE_FORMAT).to_string()
}

/// Parses an RFC 1123 HTTP date, falling back to generic RFC 2822 parsing.
pub fn parse_http_date(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    let value = value.trim();

    if let Ok(naive) = NaiveDateTime::parse_from_str(value, HTTP_DATE_FORMAT) {
        return Ok(naive.and_utc());
    }

    DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TimestampError::InvalidHttpDate(value.to_string()))
}

/// Formats a datetime as a 14-digit archive timestamp.
pub fn to_timestamp14(dt: &DateTime<Utc>) -> String {
    dt.format(TIMESTAMP14_FORMAT).to_string()
}

/// Parses a 14-digit archive timestamp.
///
/// Shorter timestamps are padded the way archive indexes expect: missing
/// month/day become `01`, missing time fields become `00`.
pub fn parse_timestamp14(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    if value.is_empty() || value.len() > 14 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TimestampError::InvalidTimestamp(value.to_string()));
    }

    let mut padded = value.to_string();
    while padded.len() < 14 {
        // month and day cannot be zero
        let fill = if padded.len() == 4 || padded.len() == 6 {
            "01"
        } else {
            "0"
        };
        padded.push_str(fill);
    }
    padded.truncate(14);

    NaiveDateTime::parse_from_str(&padded, TIMESTAMP14_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| TimestampError::InvalidTimestamp(value.to_string()))
}

/// Formats a datetime for the `WARC-Date` header.
pub fn format_warc_date(dt: &DateTime<Utc>) -> String {
    dt.format(WARC_DATE_FORMAT).to_string()
}

/// Parses a `WARC-Date` header value.
pub fn parse_warc_date(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc).trunc_subsecs(0))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, WARC_DATE_FORMAT).map(|naive| naive.and_utc())
        })
        .map_err(|_| TimestampError::InvalidWarcDate(value.to_string()))
}
