//! Monotonic/UTC timestamp formatting and random id generation.
//!
//! The sorted-set key contract (`TIMESTAMP|JID`, see [`crate::store::sortedset`])
//! depends on [`format_ts`] producing a fixed-width, lexicographically
//! sortable string. Do not change the format without updating every caller
//! that parses or constructs these keys directly (admin tooling does).

use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;

/// Current UTC time.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Formats `dt` as `YYYY-MM-DDTHH:MM:SS.nnnnnnnnnZ`: fixed-width, UTC,
/// nanosecond precision, lexicographically sortable.
pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parses a timestamp produced by [`format_ts`] (or any RFC 3339 string).
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Generates a random job id: 24 random bytes, hex-encoded (48 hex chars).
pub fn random_jid() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_roundtrips_through_parse() {
        let now = now_utc();
        let s = format_ts(now);
        let back = parse_ts(&s).unwrap();
        // Nanosecond formatting should be exact.
        assert_eq!(now.timestamp_nanos_opt(), back.timestamp_nanos_opt());
    }

    #[test]
    fn format_is_fixed_width_and_sorts_lexicographically() {
        let a = now_utc();
        let b = a + chrono::Duration::nanoseconds(1);
        let sa = format_ts(a);
        let sb = format_ts(b);
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb);
    }

    #[test]
    fn jids_are_unique_and_long_enough() {
        let a = random_jid();
        let b = random_jid();
        assert_ne!(a, b);
        assert!(a.len() >= 16);
    }
}
