//! Durations written the way the agent's environment has always written
//! them, in Go's `time.ParseDuration` syntax: `15s`, `1m30s`, `500ms`.

use std::{fmt, str::FromStr, time::Duration};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GoDuration(Duration);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty duration")]
    Empty,

    #[error("durations must not be negative")]
    Negative,

    #[error("{0:?} is missing a unit (ns, us, ms, s, m or h)")]
    MissingUnit(String),

    #[error("unknown unit {0:?} (expected ns, us, ms, s, m or h)")]
    UnknownUnit(String),

    #[error("invalid number {0:?}")]
    InvalidNumber(String),
}

/// The length of one `unit`.
fn unit(name: &str) -> Option<Duration> {
    let unit = match name {
        "ns" => Duration::from_nanos(1),
        // Go accepts both the micro sign and the Greek mu.
        "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
        "ms" => Duration::from_millis(1),
        "s" => Duration::from_secs(1),
        "m" => Duration::from_secs(60),
        "h" => Duration::from_secs(60 * 60),
        _ => return None,
    };
    Some(unit)
}

/// Multiplies `unit` by a decimal `number` in integer nanoseconds, so that
/// `0.3s` is exactly 300ms.
fn scale(number: &str, unit: Duration) -> Option<Duration> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }

    let unit = unit.as_nanos();
    let mut nanos = match whole {
        "" => 0,
        whole => whole.parse::<u128>().ok()?.checked_mul(unit)?,
    };
    if !fraction.is_empty() {
        let digits = fraction.parse::<u128>().ok()?;
        let denominator = 10u128.checked_pow(u32::try_from(fraction.len()).ok()?)?;
        nanos = nanos.checked_add(digits.checked_mul(unit)? / denominator)?;
    }

    let secs = u64::try_from(nanos / 1_000_000_000).ok()?;
    Some(Duration::new(secs, (nanos % 1_000_000_000) as u32))
}

fn is_numeric(c: char) -> bool {
    c.is_ascii_digit() || c == '.'
}

// === impl GoDuration ===

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, ParseError> {
        let input = input.trim();
        let (negative, mut rest) = match input.as_bytes().first() {
            Some(b'-') => (true, &input[1..]),
            Some(b'+') => (false, &input[1..]),
            _ => (false, input),
        };
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }
        // A bare zero is the only duration allowed without a unit.
        if rest == "0" {
            return Ok(Self(Duration::ZERO));
        }

        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let number_end = rest.find(|c: char| !is_numeric(c)).unwrap_or(rest.len());
            let (number, tail) = rest.split_at(number_end);
            let (name, tail) = tail.split_at(tail.find(is_numeric).unwrap_or(tail.len()));
            if name.is_empty() {
                return Err(ParseError::MissingUnit(number.to_string()));
            }

            let unit = unit(name).ok_or_else(|| ParseError::UnknownUnit(name.to_string()))?;
            let part =
                scale(number, unit).ok_or_else(|| ParseError::InvalidNumber(number.to_string()))?;
            total = total.saturating_add(part);
            rest = tail;
        }

        if negative && !total.is_zero() {
            return Err(ParseError::Negative);
        }
        Ok(Self(total))
    }
}

impl From<GoDuration> for Duration {
    fn from(GoDuration(duration): GoDuration) -> Self {
        duration
    }
}

impl fmt::Debug for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Duration, ParseError> {
        s.parse::<GoDuration>().map(Into::into)
    }

    #[test]
    fn parses_go_durations() {
        assert_eq!(parse("0"), Ok(Duration::ZERO));
        assert_eq!(parse("-0s"), Ok(Duration::ZERO));
        assert_eq!(parse("15s"), Ok(Duration::from_secs(15)));
        assert_eq!(parse(" +5s "), Ok(Duration::from_secs(5)));
        assert_eq!(parse("1.5s"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse(".3s"), Ok(Duration::from_millis(300)));
        assert_eq!(parse("300ms"), Ok(Duration::from_millis(300)));
        assert_eq!(parse("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse("1h0m5s"), Ok(Duration::from_secs(3605)));
        assert_eq!(parse("12µs"), Ok(Duration::from_micros(12)));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!(parse(""), Err(ParseError::Empty));
        assert_eq!(parse("-5s"), Err(ParseError::Negative));
        assert_eq!(parse("15"), Err(ParseError::MissingUnit("15".to_string())));
        assert_eq!(parse("15d"), Err(ParseError::UnknownUnit("d".to_string())));
        assert_eq!(parse("s"), Err(ParseError::InvalidNumber(String::new())));
        assert_eq!(parse("1.2.3s"), Err(ParseError::InvalidNumber("1.2.3".to_string())));
    }
}
