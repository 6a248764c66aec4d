/// Timestamps are UTC and carry no subsecond precision once they've been through the codecs.  All
/// day arithmetic here is UTC day arithmetic, which is also what the directory tree uses.
use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::str::FromStr;

pub type Timestamp = DateTime<Utc>;

pub fn now() -> Timestamp {
    truncate_to_second(Utc::now())
}

pub fn epoch() -> Timestamp {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH)
}

pub fn far_future() -> Timestamp {
    timestamp_from_ymd(2999, 12, 31)
}

/// Parse an RFC 3339 timestamp (sonar emits `2023-06-05T10:00:00+02:00`) and normalize it to UTC.

pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(t) => Ok(t.with_timezone(&Utc)),
        Err(e) => bail!("Bad timestamp {s}: {e}"),
    }
}

/// Seconds since the epoch, to and from.

pub fn timestamp_from_seconds(secs: i64) -> Result<Timestamp> {
    match Utc.timestamp_opt(secs, 0).single() {
        Some(t) => Ok(t),
        None => bail!("Timestamp out of range: {secs}"),
    }
}

pub fn timestamp_to_seconds(t: Timestamp) -> i64 {
    t.timestamp()
}

/// The arguments must denote a valid UTC date and time; anything else is a programming error.

pub fn timestamp_from_ymdhms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Timestamp {
    match Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single() {
        Some(t) => t,
        None => panic!("Invalid date/time {y}-{mo}-{d} {h}:{mi}:{s}"),
    }
}

pub fn timestamp_from_ymd(y: i32, mo: u32, d: u32) -> Timestamp {
    timestamp_from_ymdhms(y, mo, d, 0, 0, 0)
}

pub fn truncate_to_second(t: Timestamp) -> Timestamp {
    t.with_nanosecond(0).unwrap_or(t)
}

pub fn truncate_to_day(t: Timestamp) -> Timestamp {
    timestamp_from_ymd(t.year(), t.month(), t.day())
}

pub fn truncate_to_hour(t: Timestamp) -> Timestamp {
    timestamp_from_ymdhms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
}

pub fn add_day(t: Timestamp) -> Timestamp {
    t + Duration::days(1)
}

pub fn add_hour(t: Timestamp) -> Timestamp {
    t + Duration::hours(1)
}

/// Round `t` up to the next midnight unless it's already at midnight.

pub fn round_up_to_day(t: Timestamp) -> Timestamp {
    let d = truncate_to_day(t);
    if d == t {
        d
    } else {
        add_day(d)
    }
}

/// Returns a vector of (year, month, day) for every UTC day in the half-open range [t1, t2), after
/// rounding t1 down and t2 up to whole days.  So a range that ends at midnight excludes that day,
/// while a range ending during a day includes it.

pub fn date_range(t1: Timestamp, t2: Timestamp) -> Vec<(i32, u32, u32)> {
    let mut days = vec![];
    let mut current = truncate_to_day(t1);
    let limit = round_up_to_day(t2);
    while current < limit {
        days.push((current.year(), current.month(), current.day()));
        current = add_day(current);
    }
    days
}

/// Parse a duration written as `WwDdHhMm` with all parts optional (but at least one present), in
/// any order, each at most once.  A bare number is taken to be seconds.

pub fn parse_duration(s: &str) -> Result<Duration> {
    if let Ok(secs) = i64::from_str(s) {
        return Ok(Duration::seconds(secs));
    }
    let mut total = 0i64;
    let mut seen = String::new();
    let mut digits = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() || !"wdhm".contains(ch) || seen.contains(ch) {
            bail!("Bad duration {s}")
        }
        let val = match i64::from_str(&digits) {
            Ok(v) => v,
            Err(_) => bail!("Bad number in duration {s}"),
        };
        digits.clear();
        seen.push(ch);
        total += val
            * match ch {
                'w' => 7 * 24 * 3600,
                'd' => 24 * 3600,
                'h' => 3600,
                _ => 60,
            };
    }
    if !digits.is_empty() || seen.is_empty() {
        bail!("Bad duration {s}")
    }
    Ok(Duration::seconds(total))
}

/// Format a number of seconds as `XdYhZm`, rounding the seconds to the nearest minute.

pub fn format_duration(secs: i64) -> String {
    let minutes = (secs + 30) / 60;
    format!(
        "{}d{}h{}m",
        minutes / (24 * 60),
        (minutes / 60) % 24,
        minutes % 60
    )
}

#[test]
fn test_date_range() {
    let from = timestamp_from_ymdhms(2023, 5, 30, 5, 20, 33);
    let to = timestamp_from_ymd(2023, 6, 4);
    assert_eq!(
        date_range(from, to),
        vec![
            (2023, 5, 30),
            (2023, 5, 31),
            (2023, 6, 1),
            (2023, 6, 2),
            (2023, 6, 3)
        ]
    );
    let to = timestamp_from_ymdhms(2023, 6, 4, 0, 0, 1);
    assert_eq!(date_range(from, to).len(), 6);
    assert!(date_range(to, to).len() == 1);
    assert!(date_range(from, from - Duration::days(2)).is_empty());
}

#[test]
fn test_parse_timestamp() {
    let t = parse_timestamp("2023-06-05T10:00:00+02:00").unwrap();
    assert!(t == timestamp_from_ymdhms(2023, 6, 5, 8, 0, 0));
    assert!(parse_timestamp("2023-06-05 10:00").is_err());
    assert!(timestamp_from_seconds(timestamp_to_seconds(t)).unwrap() == t);
}

#[test]
fn test_parse_duration() {
    assert_eq!(parse_duration("1d").unwrap(), Duration::days(1));
    assert_eq!(
        parse_duration("2h1w5m").unwrap(),
        Duration::weeks(1) + Duration::hours(2) + Duration::minutes(5)
    );
    assert_eq!(parse_duration("90").unwrap(), Duration::seconds(90));
    assert!(parse_duration("").is_err());
    assert!(parse_duration("1d2d").is_err());
    assert!(parse_duration("3").is_ok());
    assert!(parse_duration("3x").is_err());
    assert!(parse_duration("h").is_err());
    assert!(parse_duration("1d3").is_err());
}

#[test]
fn test_format_duration() {
    assert_eq!(format_duration(0), "0d0h0m");
    assert_eq!(format_duration(3600 * 26 + 61), "1d2h1m");
}
