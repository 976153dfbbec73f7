//! Parsing of operator-entered times and durations
//!
//! Used by `reel-queue reschedule` and `reel-queue sweep`.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{ReelcastError, Result};

/// Parse a target time
///
/// Supports multiple formats:
/// - RFC 3339: "2025-03-01T18:00:00Z"
/// - Local date and time in the schedule timezone: "2025-03-01 18:00"
/// - Relative durations: "2h", "in 30m", "1d 6h"
/// - Natural language in the schedule timezone: "tomorrow 9am", "next friday 18:00"
///
/// # Errors
///
/// Returns an error if the input matches none of these.
pub fn parse_when(input: &str, now: DateTime<Utc>, timezone: Tz) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ReelcastError::InvalidInput("time cannot be empty".to_string()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Some(dt) = parse_local(input, timezone) {
        return Ok(dt);
    }

    let relative = input.strip_prefix("in ").unwrap_or(input);
    if let Ok(duration) = parse_duration(relative) {
        return Ok(now + duration);
    }

    chrono_english::parse_date_string(input, now.with_timezone(&timezone), chrono_english::Dialect::Uk)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ReelcastError::InvalidInput(format!("Could not parse time '{}': {}", input, e)))
}

/// Parse a duration such as "30d" or "12h"
pub fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input.trim())
        .map_err(|e| ReelcastError::InvalidInput(format!("Could not parse duration '{}': {}", input, e)))?;
    Duration::from_std(std_duration)
        .map_err(|_| ReelcastError::InvalidInput("Duration out of range".to_string()))
}

fn parse_local(input: &str, timezone: Tz) -> Option<DateTime<Utc>> {
    ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
        .and_then(|naive| timezone.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
}
