// Calendar date and clock time rendering for message timestamps

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone};
use eyre::{Result, eyre};
use std::fmt::Display;

/// `MM/dd/yyyy`
pub const DATE_PATTERN: &str = "%m/%d/%Y";

/// `hh:mma`, e.g. `03:07PM`
pub const TIME_PATTERN: &str = "%I:%M%p";

/// Format epoch milliseconds as a calendar date in the local time zone
pub fn format_date(ts_ms: i64) -> Result<String> {
    format_date_in(ts_ms, &Local)
}

/// Format epoch milliseconds as a 12-hour clock time in the local time zone
pub fn format_time(ts_ms: i64) -> Result<String> {
    format_time_in(ts_ms, &Local)
}

pub fn format_date_in<Tz>(ts_ms: i64, tz: &Tz) -> Result<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format_in(ts_ms, tz, DATE_PATTERN)
}

pub fn format_time_in<Tz>(ts_ms: i64, tz: &Tz) -> Result<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format_in(ts_ms, tz, TIME_PATTERN)
}

fn format_in<Tz>(ts_ms: i64, tz: &Tz, pattern: &str) -> Result<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let instant = DateTime::from_timestamp_millis(ts_ms).ok_or_else(|| eyre!("Timestamp out of range: {}", ts_ms))?;
    Ok(instant.with_timezone(tz).format(pattern).to_string())
}

/// True if `s` is a zero-padded `MM/dd/yyyy` date
pub fn matches_date_pattern(s: &str) -> bool {
    s.len() == 10 && NaiveDate::parse_from_str(s, DATE_PATTERN).is_ok()
}

/// True if `s` is a zero-padded `hh:mma` time
pub fn matches_time_pattern(s: &str) -> bool {
    s.len() == 7 && NaiveTime::parse_from_str(s, TIME_PATTERN).is_ok()
}
