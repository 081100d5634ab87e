//! Wall-clock timestamps.
//!
//! All archive bookkeeping is in microseconds since the Unix epoch; ring
//! slots carry a split seconds/nanoseconds stamp taken at block completion.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{FaError, Result};

/// Wall-clock time of a captured block, seconds plus nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let now = Utc::now();
        Timestamp {
            sec: now.timestamp(),
            nsec: now.timestamp_subsec_nanos(),
        }
    }

    pub fn from_micros(us: u64) -> Self {
        Timestamp {
            sec: (us / 1_000_000) as i64,
            nsec: ((us % 1_000_000) * 1000) as u32,
        }
    }

    /// Microseconds since the Unix epoch.
    pub fn as_micros(&self) -> u64 {
        self.sec as u64 * 1_000_000 + self.nsec as u64 / 1000
    }
}

/// Parses the `T<iso-datetime>` form of a read request start time, e.g.
/// `2011-02-01T09:00:00` or with a fractional second suffix.  The time is
/// interpreted as UTC.
pub fn parse_datetime(input: &str, text: &str) -> Result<u64> {
    let parsed = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| FaError::parse("timestamp", e.to_string(), input, text))?;
    let utc: DateTime<Utc> = DateTime::from_naive_utc_and_offset(parsed, Utc);
    let us = utc.timestamp_micros();
    if us <= 0 {
        return Err(FaError::parse(
            "timestamp",
            "Timestamp ridiculously early",
            input,
            text,
        ));
    }
    Ok(us as u64)
}

/// Parses the `S<seconds>[.<fraction>]` epoch form of a start time.
pub fn parse_seconds(input: &str, text: &str) -> Result<u64> {
    let (sec_text, frac_text) = match text.split_once('.') {
        Some((s, f)) => (s, Some(f)),
        None => (text, None),
    };
    let sec: u64 = sec_text
        .parse()
        .map_err(|e: std::num::ParseIntError| FaError::parse("timestamp", e.to_string(), input, text))?;
    if sec == 0 {
        return Err(FaError::parse(
            "timestamp",
            "Timestamp ridiculously early",
            input,
            text,
        ));
    }
    let mut micros = sec * 1_000_000;
    if let Some(frac) = frac_text {
        if frac.is_empty() || frac.len() > 9 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(FaError::parse("timestamp", "Bad fraction", input, text));
        }
        let mut ns: u64 = frac.parse().map_err(|e: std::num::ParseIntError| {
            FaError::parse("timestamp", e.to_string(), input, text)
        })?;
        for _ in frac.len()..9 {
            ns *= 10;
        }
        micros += ns / 1000;
    }
    Ok(micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_round_trip() {
        let ts = Timestamp {
            sec: 1_700_000_000,
            nsec: 123_456_000,
        };
        assert_eq!(ts.as_micros(), 1_700_000_000_123_456);
        assert_eq!(Timestamp::from_micros(ts.as_micros()), ts);
    }

    #[test]
    fn parses_iso_datetime() {
        let us = parse_datetime("q", "2011-02-01T00:00:00").unwrap();
        assert_eq!(us, 1_296_518_400_000_000);
        let frac = parse_datetime("q", "2011-02-01T00:00:00.5").unwrap();
        assert_eq!(frac, us + 500_000);
    }

    #[test]
    fn parses_epoch_seconds() {
        assert_eq!(parse_seconds("q", "100").unwrap(), 100_000_000);
        assert_eq!(parse_seconds("q", "100.25").unwrap(), 100_250_000);
        assert!(parse_seconds("q", "0").is_err());
        assert!(parse_seconds("q", "1.x").is_err());
    }
}
