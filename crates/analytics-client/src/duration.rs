//! Duration strings in the wire format the query service speaks.
//!
//! The service serialises durations the way Go's `time.Duration` does:
//! a sequence of decimal numbers with unit suffixes, e.g. `"300ms"`,
//! `"1m30s"`, `"8.2ms"`. Fractional components rule out the common
//! human-duration crates, so the codec lives here.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration {input:?}: {reason}")]
pub(crate) struct ParseDurationError {
    pub input: String,
    pub reason: &'static str,
}

fn parse_error(input: &str, reason: &'static str) -> ParseDurationError {
    ParseDurationError {
        input: input.to_string(),
        reason,
    }
}

/// Parses a duration string such as `"10s"`, `"2m30s"` or `"123.45ms"`.
///
/// Supported units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. A bare `"0"` is
/// accepted without a unit. Negative durations are rejected.
pub(crate) fn parse_duration(input: &str) -> Result<Duration, ParseDurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(parse_error(input, "empty string"));
    }

    if s == "0" {
        return Ok(Duration::ZERO);
    }

    if s.starts_with('-') || s.starts_with('+') {
        return Err(parse_error(input, "signed durations are not supported"));
    }

    let mut rest = s;
    let mut total_nanos: u128 = 0;

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| parse_error(input, "missing unit"))?;
        if digits_end == 0 {
            return Err(parse_error(input, "expected a number"));
        }

        let number: f64 = rest[..digits_end]
            .parse()
            .map_err(|_| parse_error(input, "malformed number"))?;
        rest = &rest[digits_end..];

        let (unit_nanos, unit_len) = match_unit(rest).ok_or_else(|| parse_error(input, "unknown unit"))?;
        rest = &rest[unit_len..];

        total_nanos += (number * unit_nanos as f64) as u128;
    }

    let secs = (total_nanos / 1_000_000_000) as u64;
    let nanos = (total_nanos % 1_000_000_000) as u32;

    Ok(Duration::new(secs, nanos))
}

fn match_unit(s: &str) -> Option<(u64, usize)> {
    // Longest suffix first so "ms" is not read as "m".
    for (unit, nanos) in [
        ("ns", 1),
        ("us", 1_000),
        ("µs", 1_000),
        ("μs", 1_000),
        ("ms", 1_000_000),
        ("s", 1_000_000_000),
        ("m", 60 * 1_000_000_000),
        ("h", 3_600 * 1_000_000_000),
    ] {
        if s.starts_with(unit) {
            return Some((nanos, unit.len()));
        }
    }

    None
}

/// Formats a duration in a shape `parse_duration` and the service both
/// accept: whole milliseconds where possible, nanoseconds otherwise.
pub(crate) fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }

    if nanos % 1_000_000 == 0 {
        format!("{}ms", nanos / 1_000_000)
    } else {
        format!("{}ns", nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("15ns").unwrap(), Duration::from_nanos(15));
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(
            parse_duration("1h2m3s").unwrap(),
            Duration::from_secs(3723)
        );
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(
            parse_duration("8.2ms").unwrap(),
            Duration::from_micros(8200)
        );
    }

    #[test]
    fn test_parse_zero() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10parsecs").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("ten seconds").is_err());
    }

    #[test]
    fn test_format_whole_milliseconds() {
        assert_eq!(format_duration(Duration::from_secs(600)), "600000ms");
        assert_eq!(format_duration(Duration::from_millis(1)), "1ms");
    }

    #[test]
    fn test_format_sub_millisecond() {
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1500ns");
    }

    #[test]
    fn test_format_zero() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_round_trip() {
        for d in [
            Duration::from_millis(250),
            Duration::from_secs(600),
            Duration::from_nanos(1234567),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }
}
