//! FIX timestamp, date and time fields.
//!
//! Wire grammar: timestamps `yyyyMMdd-HH:mm:ss[.SSS[SSS[SSS]]]`, dates
//! `yyyyMMdd`, times `HH:mm:ss[.SSS[SSS[SSS]]]`. Parsing returns epoch (or
//! midnight-relative) nanoseconds, or -1 for anything malformed. Bursts of
//! timestamps share a calendar computation through a cached
//! `(year, month, day, hour) -> start-of-hour` base; only a cache miss pays
//! for chrono's calendar math.

use std::cell::Cell;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MIN: i64 = 60 * NANOS_PER_SEC;

/// Fixed-width ASCII decimal; -1 on any non-digit byte.
fn dec(bytes: &[u8]) -> i64 {
    let mut value: i64 = 0;
    if bytes.is_empty() {
        return -1;
    }
    for &b in bytes {
        if !b.is_ascii_digit() {
            return -1;
        }
        value = value * 10 + i64::from(b - b'0');
    }
    value
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: i64, month: i64) -> i64 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if is_leap_year(year) {
                29
            } else {
                28
            }
        }
        _ => 0,
    }
}

/// Fractional seconds in nanos: absent, or exactly 3, 6 or 9 digits.
fn frac_nanos(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    if bytes[0] != b'.' {
        return -1;
    }
    let digits = &bytes[1..];
    let scale = match digits.len() {
        3 => 1_000_000,
        6 => 1_000,
        9 => 1,
        _ => return -1,
    };
    let value = dec(digits);
    if value < 0 {
        return -1;
    }
    value * scale
}

/// Parses wall-clock fields with a one-entry hour cache.
#[derive(Debug)]
pub struct TimestampParser {
    cached_key: Cell<i64>,
    cached_base: Cell<i64>,
}

impl Default for TimestampParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampParser {
    pub fn new() -> Self {
        Self {
            cached_key: Cell::new(-1),
            cached_base: Cell::new(0),
        }
    }

    /// `yyyyMMdd-HH:mm:ss[.SSS[SSS[SSS]]]` to epoch nanos, or -1.
    pub fn parse_timestamp(&self, bytes: &[u8]) -> i64 {
        if bytes.len() < 17 || bytes[8] != b'-' {
            return -1;
        }
        let base = self.hour_base(&bytes[..8], &bytes[9..11]);
        if base < 0 {
            return -1;
        }
        let remainder = time_past_hour(&bytes[11..]);
        if remainder < 0 {
            return -1;
        }
        base + remainder
    }

    /// `yyyyMMdd` to epoch nanos at midnight, or -1.
    pub fn parse_date(&self, bytes: &[u8]) -> i64 {
        if bytes.len() != 8 {
            return -1;
        }
        self.hour_base(bytes, b"00")
    }

    /// `HH:mm:ss[.SSS[SSS[SSS]]]` to nanos past midnight, or -1.
    pub fn parse_time(&self, bytes: &[u8]) -> i64 {
        if bytes.len() < 8 {
            return -1;
        }
        let hour = dec(&bytes[..2]);
        if !(0..=23).contains(&hour) {
            return -1;
        }
        let remainder = time_past_hour(&bytes[2..]);
        if remainder < 0 {
            return -1;
        }
        hour * 60 * NANOS_PER_MIN + remainder
    }

    /// Start-of-hour epoch nanos for a `yyyyMMdd` date and 2-digit hour.
    fn hour_base(&self, date: &[u8], hour: &[u8]) -> i64 {
        let year = dec(&date[..4]);
        let month = dec(&date[4..6]);
        let day = dec(&date[6..8]);
        let hour = dec(hour);
        if !(1..=12).contains(&month)
            || day < 1
            || day > days_in_month(year, month)
            || !(0..=23).contains(&hour)
        {
            return -1;
        }

        let key = ((year * 100 + month) * 100 + day) * 100 + hour;
        if self.cached_key.get() == key {
            return self.cached_base.get();
        }

        let base = Utc
            .with_ymd_and_hms(year as i32, month as u32, day as u32, hour as u32, 0, 0)
            .single()
            .and_then(|dt| dt.timestamp_nanos_opt());
        match base {
            Some(base) => {
                self.cached_key.set(key);
                self.cached_base.set(base);
                base
            }
            None => -1,
        }
    }
}

/// `mm:ss[.frac]` (with the leading colon) to nanos past the hour, or -1.
fn time_past_hour(bytes: &[u8]) -> i64 {
    if bytes.len() < 6 || bytes[0] != b':' || bytes[3] != b':' {
        return -1;
    }
    let minute = dec(&bytes[1..3]);
    let second = dec(&bytes[4..6]);
    // Second 60 is a leap second.
    if !(0..=59).contains(&minute) || !(0..=60).contains(&second) {
        return -1;
    }
    let frac = frac_nanos(&bytes[6..]);
    if frac < 0 {
        return -1;
    }
    minute * NANOS_PER_MIN + second * NANOS_PER_SEC + frac
}

/// Appends `yyyyMMdd-HH:mm:ss.SSS` for `epoch_ns`. Always millisecond
/// precision; callers needing finer resolution extend this.
pub fn put_timestamp_millis(dst: &mut Vec<u8>, epoch_ns: i64) {
    let secs = epoch_ns.div_euclid(NANOS_PER_SEC);
    let subsec = epoch_ns.rem_euclid(NANOS_PER_SEC) as u32;
    let dt = DateTime::<Utc>::from_timestamp(secs, subsec).unwrap_or(DateTime::UNIX_EPOCH);

    put_padded(dst, dt.year() as i64, 4);
    put_padded(dst, i64::from(dt.month()), 2);
    put_padded(dst, i64::from(dt.day()), 2);
    dst.push(b'-');
    put_padded(dst, i64::from(dt.hour()), 2);
    dst.push(b':');
    put_padded(dst, i64::from(dt.minute()), 2);
    dst.push(b':');
    put_padded(dst, i64::from(dt.second()), 2);
    dst.push(b'.');
    put_padded(dst, i64::from(subsec / 1_000_000), 3);
}

fn put_padded(dst: &mut Vec<u8>, value: i64, width: usize) {
    let digits = meridian_common::buf::ascii_size(value);
    for _ in digits..width {
        dst.push(b'0');
    }
    let start = dst.len();
    dst.resize(start + digits, 0);
    meridian_common::buf::put_long_ascii(&mut dst[start..], value);
}
