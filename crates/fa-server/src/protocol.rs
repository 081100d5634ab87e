//! Command grammar.
//!
//! One command per connection, no spaces:
//!
//! ```text
//! command        = subscription | read-request | control
//! subscription   = "S" mask [ "T" ]
//! read-request   = "R" source "M" mask start "N" samples
//! source         = "F" | "D" [ "D" ] [ "F" data-mask ]
//! start          = "T" date-time | "S" seconds [ "." fraction ]
//! mask           = "R" 64*hex-digit | id-list
//! control        = "C" 1*( "Q" | "H" | "R" | "S" | "F" | "d" | "D" )
//! ```
//!
//! For decimated sources the optional data-mask selects which of the
//! mean/min/max/std fields (bits 0..3) are returned; all four by default.

use fa_core::mask::RAW_MASK_CHARS;
use fa_core::{timing, BpmMask, FaError, Result};

/// Which archive data a read request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Full-rate FA samples.
    Fa,
    /// First-decimated samples, with a field selection mask.
    D { data_mask: u8 },
    /// Double-decimated samples, with a field selection mask.
    Dd { data_mask: u8 },
}

/// A parsed historical read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub source: ReadSource,
    pub mask: BpmMask,
    /// Start of the requested range, microseconds since epoch.
    pub start_us: u64,
    pub samples: u64,
}

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe { mask: BpmMask, want_timestamp: bool },
    Read(ReadRequest),
    /// Control characters, validated but executed one at a time.
    Control(Vec<char>),
}

/// Parses a complete command line.
pub fn parse_command(line: &str) -> Result<Command> {
    match line.chars().next() {
        Some('S') => parse_subscription(line),
        Some('R') => parse_read(line),
        Some('C') => parse_control(line),
        _ => Err(FaError::parse(
            "command",
            "Expected S, R or C command",
            line,
            line,
        )),
    }
}

fn parse_subscription(line: &str) -> Result<Command> {
    let rest = &line[1..];
    let (mask, rest) = parse_mask(line, rest)?;
    let (want_timestamp, rest) = match rest.strip_prefix('T') {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    expect_end(line, rest)?;
    Ok(Command::Subscribe {
        mask,
        want_timestamp,
    })
}

fn parse_read(line: &str) -> Result<Command> {
    let rest = &line[1..];
    let (source, rest) = parse_source(line, rest)?;
    let rest = expect_char(line, rest, 'M')?;
    let (mask, rest) = parse_mask(line, rest)?;
    let (start_us, rest) = parse_start(line, rest)?;
    let rest = expect_char(line, rest, 'N')?;
    let (samples, rest) = parse_uint(line, rest)?;
    expect_end(line, rest)?;
    if samples == 0 {
        return Err(FaError::parse("read request", "No samples requested", line, rest));
    }
    Ok(Command::Read(ReadRequest {
        source,
        mask,
        start_us,
        samples,
    }))
}

fn parse_source<'a>(line: &str, rest: &'a str) -> Result<(ReadSource, &'a str)> {
    if let Some(rest) = rest.strip_prefix('F') {
        return Ok((ReadSource::Fa, rest));
    }
    let Some(rest) = rest.strip_prefix('D') else {
        return Err(FaError::parse(
            "read request",
            "Invalid source specification",
            line,
            rest,
        ));
    };
    let (double, rest) = match rest.strip_prefix('D') {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    let (data_mask, rest) = match rest.strip_prefix('F') {
        Some(rest) => {
            let (value, rest) = parse_uint(line, rest)?;
            if value == 0 || value > 0xf {
                return Err(FaError::parse(
                    "read request",
                    "Invalid data mask",
                    line,
                    rest,
                ));
            }
            (value as u8, rest)
        }
        None => (0xf, rest),
    };
    let source = if double {
        ReadSource::Dd { data_mask }
    } else {
        ReadSource::D { data_mask }
    };
    Ok((source, rest))
}

fn parse_start<'a>(line: &str, rest: &'a str) -> Result<(u64, &'a str)> {
    if let Some(rest) = rest.strip_prefix('T') {
        let end = rest.find('N').unwrap_or(rest.len());
        let us = timing::parse_datetime(line, &rest[..end])?;
        Ok((us, &rest[end..]))
    } else if let Some(rest) = rest.strip_prefix('S') {
        let end = rest.find('N').unwrap_or(rest.len());
        let us = timing::parse_seconds(line, &rest[..end])?;
        Ok((us, &rest[end..]))
    } else {
        Err(FaError::parse(
            "read request",
            "Expected T or S for timestamp",
            line,
            rest,
        ))
    }
}

fn parse_control(line: &str) -> Result<Command> {
    let rest = &line[1..];
    if rest.is_empty() {
        return Err(FaError::parse("command", "Missing control character", line, rest));
    }
    for (at, c) in rest.char_indices() {
        if !matches!(c, 'Q' | 'H' | 'R' | 'S' | 'F' | 'd' | 'D') {
            return Err(FaError::parse(
                "command",
                format!("Unknown control character '{c}'"),
                line,
                &rest[at..],
            ));
        }
    }
    Ok(Command::Control(rest.chars().collect()))
}

/// Parses a mask: raw `R` + 64 hex digits, or an id list.
fn parse_mask<'a>(line: &str, rest: &'a str) -> Result<(BpmMask, &'a str)> {
    if let Some(raw) = rest.strip_prefix('R') {
        if raw.len() < RAW_MASK_CHARS {
            return Err(FaError::parse(
                "mask",
                format!("Expected {RAW_MASK_CHARS} hex digits"),
                line,
                raw,
            ));
        }
        let mask = BpmMask::parse_raw(&raw[..RAW_MASK_CHARS])?;
        Ok((mask, &raw[RAW_MASK_CHARS..]))
    } else {
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == ',' || c == '-'))
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(FaError::parse("mask", "Number missing", line, rest));
        }
        let mask = BpmMask::parse_ids(&rest[..end])?;
        Ok((mask, &rest[end..]))
    }
}

fn parse_uint<'a>(line: &str, rest: &'a str) -> Result<(u64, &'a str)> {
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        return Err(FaError::parse("command", "Number missing", line, rest));
    }
    let value = rest[..end]
        .parse()
        .map_err(|e: std::num::ParseIntError| FaError::parse("command", e.to_string(), line, rest))?;
    Ok((value, &rest[end..]))
}

fn expect_char<'a>(line: &str, rest: &'a str, c: char) -> Result<&'a str> {
    rest.strip_prefix(c)
        .ok_or_else(|| FaError::parse("command", format!("Expected '{c}'"), line, rest))
}

fn expect_end(line: &str, rest: &str) -> Result<()> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(FaError::parse("command", "Unexpected characters", line, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscription() {
        let command = parse_command("S1,3,10-12").unwrap();
        let Command::Subscribe {
            mask,
            want_timestamp,
        } = command
        else {
            panic!("expected subscription");
        };
        assert_eq!(mask.count(), 5);
        assert!(!want_timestamp);

        let command = parse_command(&format!("SR{}T", "F".repeat(64))).unwrap();
        let Command::Subscribe {
            mask,
            want_timestamp,
        } = command
        else {
            panic!("expected subscription");
        };
        assert_eq!(mask.count(), 256);
        assert!(want_timestamp);
    }

    #[test]
    fn parses_fa_read() {
        let command = parse_command("RFM1,2T2011-02-01T09:00:00N1000").unwrap();
        let Command::Read(request) = command else {
            panic!("expected read");
        };
        assert_eq!(request.source, ReadSource::Fa);
        assert_eq!(request.mask.count(), 2);
        assert_eq!(request.samples, 1000);
        assert_eq!(
            request.start_us,
            timing::parse_datetime("q", "2011-02-01T09:00:00").unwrap()
        );
    }

    #[test]
    fn parses_decimated_sources() {
        let Command::Read(request) = parse_command("RDM0S100N10").unwrap() else {
            panic!("expected read");
        };
        assert_eq!(request.source, ReadSource::D { data_mask: 0xf });
        assert_eq!(request.start_us, 100_000_000);

        let Command::Read(request) = parse_command("RDDF5M0S100.5N10").unwrap() else {
            panic!("expected read");
        };
        assert_eq!(request.source, ReadSource::Dd { data_mask: 5 });
        assert_eq!(request.start_us, 100_500_000);
    }

    #[test]
    fn parses_control() {
        assert_eq!(parse_command("CQ").unwrap(), Command::Control(vec!['Q']));
        assert_eq!(
            parse_command("CFdD").unwrap(),
            Command::Control(vec!['F', 'd', 'D'])
        );
        assert!(parse_command("CX").is_err());
        assert!(parse_command("C").is_err());
    }

    #[test]
    fn rejects_malformed_requests() {
        assert!(parse_command("").is_err());
        assert!(parse_command("X").is_err());
        assert!(parse_command("RFM1N10").is_err()); // missing start
        assert!(parse_command("RFM1S100N0").is_err()); // zero samples
        assert!(parse_command("RFM1S100N10x").is_err()); // trailing junk
        assert!(parse_command("RDF0M1S100N10").is_err()); // empty data mask
        assert!(parse_command("RQM1S100N10").is_err()); // bad source
        assert!(parse_command("S1,3,T").is_err()); // trailing comma
    }

    #[test]
    fn parse_errors_carry_offsets() {
        let err = parse_command("RFM1S100Z10").unwrap_err();
        let FaError::Parse { offset, .. } = err else {
            panic!("expected parse error");
        };
        // The offending seconds field starts at offset 5.
        assert_eq!(offset, 5);
    }
}
