//! Bucket-edge arithmetic on unix timestamps.
//!
//! Everything here is closed-form integer math so the aggregation and
//! bucketisation inner loops never touch a date library. Timestamps are
//! seconds since the unix epoch, buckets are aligned to UTC.

pub const SECONDS_HOUR: i64 = 60 * 60;
pub const SECONDS_DAY: i64 = 24 * 60 * 60;
pub const SECONDS_WEEK: i64 = 7 * SECONDS_DAY;
pub const SECONDS_10MIN: i64 = 10 * 60;

/// (year, month, day) of the civil date `days` after 1970-01-01.
pub(crate) fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn is_leap_year(year: i64) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

fn days_in_month(year: i64, month: u32) -> i64 {
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
        _ => unreachable!("month out of range"),
    }
}

pub fn ten_minute_left(ts: i64) -> i64 {
    ts - ts.rem_euclid(SECONDS_10MIN)
}

pub fn ten_minute_right(ts: i64) -> i64 {
    ten_minute_left(ts) + SECONDS_10MIN - 1
}

pub fn hour_left(ts: i64) -> i64 {
    ts - ts.rem_euclid(SECONDS_HOUR)
}

pub fn hour_right(ts: i64) -> i64 {
    hour_left(ts) + SECONDS_HOUR - 1
}

pub fn day_left(ts: i64) -> i64 {
    ts - ts.rem_euclid(SECONDS_DAY)
}

pub fn day_right(ts: i64) -> i64 {
    day_left(ts) + SECONDS_DAY - 1
}

/// Monday-based weekday index (monday = 0) of the day containing `ts`.
fn weekday_index(ts: i64) -> i64 {
    // 1970-01-01 was a thursday
    (ts.div_euclid(SECONDS_DAY) + 3).rem_euclid(7)
}

pub fn week_left(ts: i64) -> i64 {
    day_left(ts) - weekday_index(ts) * SECONDS_DAY
}

pub fn week_right(ts: i64) -> i64 {
    week_left(ts) + SECONDS_WEEK - 1
}

pub fn month_left(ts: i64) -> i64 {
    let (_, _, day) = civil_from_days(ts.div_euclid(SECONDS_DAY));
    day_left(ts) - (day as i64 - 1) * SECONDS_DAY
}

pub fn month_right(ts: i64) -> i64 {
    let left = month_left(ts);
    let (year, month, _) = civil_from_days(left.div_euclid(SECONDS_DAY));
    left + days_in_month(year, month) * SECONDS_DAY - 1
}

/// Left edges of all day buckets overlapping `[from_ts, to_ts]`.
pub fn iter_days(from_ts: i64, to_ts: i64) -> impl Iterator<Item = i64> {
    let first = day_left(from_ts);
    (0..)
        .map(move |i| first + i * SECONDS_DAY)
        .take_while(move |ts| *ts <= to_ts)
}

/// Left edges of all month buckets overlapping `[from_ts, to_ts]`.
pub fn iter_months(from_ts: i64, to_ts: i64) -> impl Iterator<Item = i64> {
    // stepping 32 days from a month's first day always lands in the next month
    std::iter::successors(Some(month_left(from_ts)), |cur| {
        Some(month_left(cur + 32 * SECONDS_DAY))
    })
    .take_while(move |ts| *ts <= to_ts)
}

/// Lexicographically decreasing day key, e.g. 2015-02-05 -> "29854845".
pub fn reverse_day_key(ts: i64) -> String {
    let (y, m, d) = civil_from_days(ts.div_euclid(SECONDS_DAY));
    format!("{:04}{:02}{:02}", 5000 - y, 50 - m, 50 - d)
}

/// Lexicographically decreasing month key, e.g. 2015-02 -> "298548".
pub fn reverse_month_key(ts: i64) -> String {
    let (y, m, _) = civil_from_days(ts.div_euclid(SECONDS_DAY));
    format!("{:04}{:02}", 5000 - y, 50 - m)
}

/// Invert a reverse day key back into its "YYYYMMDD" form.
pub fn day_from_reverse_key(reverse_key: &str) -> Option<String> {
    if reverse_key.len() != 8 || !reverse_key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let y: i64 = reverse_key[0..4].parse().ok()?;
    let m: i64 = reverse_key[4..6].parse().ok()?;
    let d: i64 = reverse_key[6..8].parse().ok()?;
    Some(format!("{:04}{:02}{:02}", 5000 - y, 50 - m, 50 - d))
}

/// Two-digit UTC hour of `ts`, used as activity cell qualifier prefix.
pub fn hour_key(ts: i64) -> String {
    format!("{:02}", ts.rem_euclid(SECONDS_DAY) / SECONDS_HOUR)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2020-01-01T00:00:00Z
    const Y2020: i64 = 1_577_836_800;
    // 2015-02-05T12:00:00Z
    const FEB5: i64 = 1_423_137_600;

    #[test]
    fn test_hour_edges() {
        let ts = Y2020 + 3 * SECONDS_HOUR + 123;
        assert_eq!(hour_left(ts), Y2020 + 3 * SECONDS_HOUR);
        assert_eq!(hour_right(ts) - hour_left(ts), SECONDS_HOUR - 1);
        assert!(hour_left(ts) <= ts && ts <= hour_right(ts));
    }

    #[test]
    fn test_day_edges() {
        let ts = Y2020 + 13 * SECONDS_HOUR;
        assert_eq!(day_left(ts), Y2020);
        assert_eq!(day_right(ts), Y2020 + SECONDS_DAY - 1);
        assert_eq!(day_right(ts) - day_left(ts), 86_399);
    }

    #[test]
    fn test_day_edges_negative_ts() {
        // 1969-12-31T23:00:00Z
        let ts = -SECONDS_HOUR;
        assert_eq!(day_left(ts), -SECONDS_DAY);
        assert_eq!(day_right(ts), -1);
    }

    #[test]
    fn test_week_edges() {
        // 2020-01-01 was a wednesday; the week starts monday 2019-12-30
        assert_eq!(week_left(Y2020), Y2020 - 2 * SECONDS_DAY);
        assert_eq!(week_right(Y2020), Y2020 + 5 * SECONDS_DAY - 1);
    }

    #[test]
    fn test_month_edges_leap() {
        // 2020-02-15 -> [2020-02-01, 2020-02-29T23:59:59]
        let feb15 = Y2020 + 45 * SECONDS_DAY;
        assert_eq!(month_left(feb15), Y2020 + 31 * SECONDS_DAY);
        assert_eq!(month_right(feb15), Y2020 + 60 * SECONDS_DAY - 1);
    }

    #[test]
    fn test_month_edges_non_leap() {
        // 2015-02
        assert_eq!(
            month_right(FEB5) - month_left(FEB5),
            28 * SECONDS_DAY - 1
        );
    }

    #[test]
    fn test_iter_days() {
        let days: Vec<i64> = iter_days(Y2020 + 100, Y2020 + 3 * SECONDS_DAY).collect();
        assert_eq!(
            days,
            vec![
                Y2020,
                Y2020 + SECONDS_DAY,
                Y2020 + 2 * SECONDS_DAY,
                Y2020 + 3 * SECONDS_DAY
            ]
        );
    }

    #[test]
    fn test_iter_months() {
        let months: Vec<i64> = iter_months(Y2020, Y2020 + 70 * SECONDS_DAY).collect();
        // jan, feb (leap), mar
        assert_eq!(
            months,
            vec![Y2020, Y2020 + 31 * SECONDS_DAY, Y2020 + 60 * SECONDS_DAY]
        );
    }

    #[test]
    fn test_reverse_day_key() {
        assert_eq!(reverse_day_key(FEB5), "29854845");
        assert_eq!(reverse_month_key(FEB5), "298548");
        assert_eq!(day_from_reverse_key("29854845").unwrap(), "20150205");
        assert_eq!(day_from_reverse_key("garbage!"), None);
    }

    #[test]
    fn test_reverse_day_key_monotonic() {
        let mut prev = reverse_day_key(Y2020 - 400 * SECONDS_DAY);
        for i in 1..800 {
            let cur = reverse_day_key(Y2020 - 400 * SECONDS_DAY + i * SECONDS_DAY);
            assert!(cur < prev, "{cur} should sort before {prev}");
            prev = cur;
        }
    }

    #[test]
    fn test_hour_key() {
        assert_eq!(hour_key(FEB5), "12");
        assert_eq!(hour_key(Y2020), "00");
    }

    #[test]
    fn test_civil_round_trip() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(Y2020 / SECONDS_DAY), (2020, 1, 1));
        assert_eq!(civil_from_days(-1), (1969, 12, 31));
    }
}
