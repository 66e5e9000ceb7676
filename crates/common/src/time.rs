//! Timestamp helpers shared by the storage layer and the wire protocol.

use chrono::{DateTime, Utc};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Seconds since the Unix epoch.
#[must_use]
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// RFC 3339 rendering used on the wire for timestamps.
#[must_use]
pub fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse a millisecond epoch timestamp back into a UTC datetime.
///
/// Out-of-range values clamp to the epoch rather than panicking; SQLite
/// cannot hand back a timestamp that far out unless the row was corrupted.
#[must_use]
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}
