//! Deterministic denial event identity.
//!
//! `event_key = hex(sha256(remit_id | claim_id | posted_ts | reason_code))`,
//! with absent fields hashed as empty strings and `posted_ts` rendered the way
//! a SQL `cast(timestamp as string)` renders it.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound as _, Utc};
use sha2::{Digest, Sha256};

/// Computes the event key from its four identity fields.
#[must_use]
pub fn event_key(
    remit_id: Option<&str>,
    claim_id: Option<&str>,
    posted_ts: Option<&str>,
    reason_code: Option<&str>,
) -> String {
    let joined = [remit_id, claim_id, posted_ts, reason_code]
        .map(|field| field.unwrap_or(""))
        .join("|");
    hex::encode(Sha256::digest(joined.as_bytes()))
}

/// Renders a timestamp as `YYYY-MM-DD HH:MM:SS[.fraction]` in UTC.
///
/// Timestamps carry microsecond precision; anything finer is truncated. The
/// fraction is present only when non-zero, with trailing zeros removed.
#[must_use]
pub fn timestamp_to_string(ts: &DateTime<Utc>) -> String {
    let base = ts.format("%Y-%m-%d %H:%M:%S").to_string();
    let micros = ts.timestamp_subsec_micros();
    if micros == 0 {
        return base;
    }
    let fraction = format!("{micros:06}");
    format!("{base}.{}", fraction.trim_end_matches('0'))
}

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parses a posted timestamp.
///
/// Accepts RFC 3339, and ISO-like forms without an offset (read as UTC),
/// with or without seconds, or a bare date (midnight UTC). Fractions finer
/// than a microsecond are truncated.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc).trunc_subsecs(6));
    }

    let naive = raw.strip_suffix('Z').unwrap_or(raw);
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(naive, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(naive, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|ts| ts.and_utc().trunc_subsecs(6))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_sha256_of_pipe_joined_fields() {
        let key = event_key(Some("R1"), Some("C1"), Some("2024-01-01 00:00:00"), Some("50"));
        assert_eq!(key, hex::encode(Sha256::digest(b"R1|C1|2024-01-01 00:00:00|50")));
        assert_eq!(key.len(), 64);
    }

    #[test]
    fn key_is_deterministic() {
        let a = event_key(Some("R1"), Some("C1"), Some("2024-01-01 00:00:00"), Some("50"));
        let b = event_key(Some("R1"), Some("C1"), Some("2024-01-01 00:00:00"), Some("50"));
        assert_eq!(a, b);
        assert_ne!(a, event_key(Some("R1"), Some("C1"), Some("2024-01-01 00:00:00"), Some("45")));
    }

    #[test]
    fn absent_fields_hash_as_empty() {
        assert_eq!(
            event_key(None, Some("C1"), None, Some("50")),
            event_key(Some(""), Some("C1"), Some(""), Some("50"))
        );
        assert_eq!(
            event_key(None, None, None, None),
            hex::encode(Sha256::digest(b"|||"))
        );
    }

    #[test]
    fn timestamp_string_trims_fraction() {
        let whole = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(timestamp_to_string(&whole), "2024-01-01 00:00:00");

        let half = parse_timestamp("2024-01-01T00:00:00.500Z").unwrap();
        assert_eq!(timestamp_to_string(&half), "2024-01-01 00:00:00.5");

        let micros = parse_timestamp("2024-03-05T07:08:09.000120Z").unwrap();
        assert_eq!(timestamp_to_string(&micros), "2024-03-05 07:08:09.00012");
    }

    #[test]
    fn sub_microsecond_digits_are_truncated() {
        let parsed = parse_timestamp("2024-03-05T07:08:09.123456789Z").unwrap();
        assert_eq!(timestamp_to_string(&parsed), "2024-03-05 07:08:09.123456");
        assert_eq!(parsed, parse_timestamp("2024-03-05 07:08:09.123456").unwrap());

        let whole = parse_timestamp("2024-03-05T07:08:09Z").unwrap();
        let nanos = whole + chrono::Duration::nanoseconds(999);
        assert_eq!(timestamp_to_string(&nanos), "2024-03-05 07:08:09");
    }

    #[test]
    fn parses_common_forms_to_the_same_instant() {
        let expected = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        for raw in [
            "2024-01-01T00:00Z",
            "2024-01-01T00:00",
            "2024-01-01 00:00:00",
            "2024-01-01T01:00:00+01:00",
            "2024-01-01",
        ] {
            assert_eq!(parse_timestamp(raw), Some(expected), "{raw}");
        }
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp(""), None);
    }
}
