//! Engine timestamp parsing.
//!
//! Server logs stamp every line with `YYYY.MM.DD-HH.MM.SS:mmm`, where the
//! millisecond part after the last colon is written without zero padding and
//! may be one to three digits wide.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

use crate::error::ParseError;

const DATE_TIME_LAYOUT: &str = "%Y.%m.%d-%H.%M.%S";

/// Parses an engine timestamp into an absolute instant.
///
/// The engine writes local server time without an offset; instants are
/// interpreted as UTC so every server shares one timeline.
pub fn parse_log_timestamp(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    let raw = raw.trim();
    let (date_time, millis) = raw
        .rsplit_once(':')
        .ok_or_else(|| ParseError::MissingMillis(raw.to_string()))?;

    if millis.is_empty() || millis.len() > 3 || !millis.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidMillis(raw.to_string()));
    }
    let millis: i64 = millis
        .parse()
        .map_err(|_| ParseError::InvalidMillis(raw.to_string()))?;

    let naive = NaiveDateTime::parse_from_str(date_time, DATE_TIME_LAYOUT).map_err(|err| {
        ParseError::InvalidDateTime {
            input: raw.to_string(),
            details: err.to_string(),
        }
    })?;

    Ok(naive.and_utc() + Duration::milliseconds(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_three_digit_millis() {
        let ts = parse_log_timestamp("2025.10.04-15.23.38:790").expect("parse");
        assert_eq!(ts.year(), 2025);
        assert_eq!(ts.month(), 10);
        assert_eq!(ts.day(), 4);
        assert_eq!(ts.hour(), 15);
        assert_eq!(ts.minute(), 23);
        assert_eq!(ts.second(), 38);
        assert_eq!(ts.timestamp_subsec_millis(), 790);
    }

    #[test]
    fn short_millis_variants_share_the_same_second() {
        let base = parse_log_timestamp("2025.10.04-15.23.38:0").expect("base");
        for (raw, millis) in [
            ("2025.10.04-15.23.38:7", 7),
            ("2025.10.04-15.23.38:79", 79),
            ("2025.10.04-15.23.38:790", 790),
        ] {
            let ts = parse_log_timestamp(raw).expect(raw);
            assert_eq!((ts - base).num_milliseconds(), millis, "{raw}");
        }
    }

    #[test]
    fn later_millis_sort_after_earlier_ones() {
        let a = parse_log_timestamp("2025.10.04-15.23.38:79").expect("a");
        let b = parse_log_timestamp("2025.10.04-15.23.38:790").expect("b");
        assert!(b > a);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(
            parse_log_timestamp("2025.10.04-15.23.38"),
            Err(ParseError::InvalidMillis(_)) | Err(ParseError::MissingMillis(_))
        ));
        assert!(matches!(
            parse_log_timestamp("2025.10.04-15.23.38:1234"),
            Err(ParseError::InvalidMillis(_))
        ));
        assert!(matches!(
            parse_log_timestamp("2025.10.04-15.23.38:"),
            Err(ParseError::InvalidMillis(_))
        ));
        assert!(matches!(
            parse_log_timestamp("2025-10-04 15:23:38:790"),
            Err(ParseError::InvalidDateTime { .. })
        ));
        assert!(matches!(
            parse_log_timestamp("garbage"),
            Err(ParseError::MissingMillis(_))
        ));
    }
}
