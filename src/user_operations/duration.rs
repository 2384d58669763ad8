//! Parser for the `1h30m` style durations used by `spec.lock.for`

use chrono::Duration;

use crate::error::{Error, Result};

/// Parse a duration such as `300ms`, `2h45m` or `1h 30m`.
///
/// A leading sign and a bare `0` are accepted on top of what
/// [`humantime::parse_duration`] understands.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let (negative, rest) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input.strip_prefix('+').unwrap_or(input)),
    };
    if rest == "0" {
        return Ok(Duration::zero());
    }

    let parsed = humantime::parse_duration(rest)
        .map_err(|e| Error::ValidationError(format!("invalid duration {input:?}: {e}")))?;
    let duration = Duration::from_std(parsed)
        .map_err(|_| Error::ValidationError(format!("duration {input:?} is out of range")))?;
    Ok(if negative { -duration } else { duration })
}
