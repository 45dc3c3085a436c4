//! Date and time functions
//!
//! All times are UTC. A datetime argument is a time value, epoch
//! milliseconds, an RFC 3339 string or a `yyyy-MM-dd HH:mm:ss` string.
//! Results that are dates or clock readings are formatted strings; see
//! [`format_time`] for the pattern letters.

use super::{arg, to_int, to_string_always, FuncResult};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use rill_core::Value;

const DATETIME: &str = "yyyy-MM-dd HH:mm:ss";
const DATE: &str = "yyyy-MM-dd";

static MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Indexed by days from Sunday.
static WEEKDAYS: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

pub(super) fn call(name: &str, args: &[Value]) -> FuncResult {
    match name {
        "now" | "current_timestamp" | "local_time" | "local_timestamp" => now(args, false),
        "cur_time" | "current_time" => now(args, true),
        "cur_date" | "current_date" => text(Utc::now(), DATE),
        "format_time" => {
            if args.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            text(to_time(arg(args, 0))?, &to_string_always(arg(args, 1)))
        }
        "date_calc" => {
            let t = to_time(arg(args, 0))?;
            let delta = to_string_always(arg(args, 1));
            let shifted = match delta.strip_prefix('-') {
                Some(rest) => t.checked_sub_signed(parse_duration(rest)?),
                None => t.checked_add_signed(parse_duration(&delta)?),
            };
            text(
                shifted.ok_or_else(|| format!("date_calc {} is out of range", delta))?,
                DATETIME,
            )
        }
        // Nanoseconds from the first argument to the second.
        "date_diff" => {
            let from = to_time(arg(args, 0))?;
            let to = to_time(arg(args, 1))?;
            (to - from)
                .num_nanoseconds()
                .map(Value::Int)
                .ok_or_else(|| "the time difference overflows nanoseconds".to_string())
        }
        "from_days" => {
            if args.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            match to_int(arg(args, 0))? {
                0 => Ok(Value::Null),
                days => {
                    let t = Duration::try_days(days - 1)
                        .and_then(|d| DateTime::<Utc>::UNIX_EPOCH.checked_add_signed(d))
                        .ok_or_else(|| format!("from_days {} is out of range", days))?;
                    text(t, DATE)
                }
            }
        }
        "from_unix_time" => {
            if args.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            match to_int(arg(args, 0))? {
                0 => Ok(Value::Null),
                secs => {
                    let t = Utc
                        .timestamp_opt(secs, 0)
                        .single()
                        .ok_or_else(|| format!("from_unix_time {} is out of range", secs))?;
                    text(t, DATETIME)
                }
            }
        }
        "last_day" => {
            let t = to_time(arg(args, 0))?;
            let (year, month) = if t.month() == 12 {
                (t.year() + 1, 1)
            } else {
                (t.year(), t.month() + 1)
            };
            let last = NaiveDate::from_ymd_opt(year, month, 1)
                .and_then(|d| d.pred_opt())
                .ok_or_else(|| format!("last_day of {} is out of range", t))?;
            Ok(Value::Str(last.format("%Y-%m-%d").to_string()))
        }
        _ => {
            let t = to_time(arg(args, 0))?;
            let v = match name {
                "day_name" => Value::from(WEEKDAYS[t.weekday().num_days_from_sunday() as usize]),
                "day_of_month" | "day" => Value::Int(i64::from(t.day())),
                "day_of_week" => Value::Int(i64::from(t.weekday().num_days_from_sunday())),
                "day_of_year" => Value::Int(i64::from(t.ordinal())),
                "hour" => Value::Int(i64::from(t.hour())),
                "minute" => Value::Int(i64::from(t.minute())),
                "second" => Value::Int(i64::from(t.second())),
                "microsecond" => Value::Int(i64::from(t.nanosecond() % 1_000_000_000 / 1_000)),
                "month" => Value::Int(i64::from(t.month())),
                "month_name" => Value::from(MONTHS[t.month0() as usize]),
                _ => return Err(format!("unknown function {}", name)),
            };
            Ok(v)
        }
    }
}

/// Current time as `yyyy-MM-dd HH:mm:ss` with `fsp` fraction digits.
fn now(args: &[Value], time_only: bool) -> FuncResult {
    let fsp = match args.first() {
        Some(v) => to_int(v)?,
        None => 0,
    };
    if !(0..=6).contains(&fsp) {
        return Err(format!("fsp {} should be between 0 and 6", fsp));
    }
    let mut pattern = if time_only { "HH:mm:ss" } else { DATETIME }.to_string();
    if fsp > 0 {
        pattern.push('.');
        pattern.extend(std::iter::repeat('S').take(fsp as usize));
    }
    text(Utc::now(), &pattern)
}

fn text(t: DateTime<Utc>, pattern: &str) -> FuncResult {
    format_time(t, pattern).map(Value::Str)
}

/// Read a datetime argument.
pub(crate) fn to_time(v: &Value) -> Result<DateTime<Utc>, String> {
    if let Some(t) = v.to_time() {
        return Ok(t);
    }
    match v {
        Value::Str(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .map(|t| t.and_utc())
            .map_err(|_| format!("cannot parse {} as a datetime", s)),
        other => Err(format!(
            "unsupported type to convert to timestamp {}",
            other.describe()
        )),
    }
}

/// Split a pattern into runs of one repeated character.
pub(crate) fn pattern_runs(pattern: &str) -> Vec<(char, usize)> {
    let mut runs: Vec<(char, usize)> = Vec::new();
    for c in pattern.chars() {
        match runs.last_mut() {
            Some((last, n)) if *last == c => *n += 1,
            _ => runs.push((c, 1)),
        }
    }
    runs
}

/// Render `t` with a `yyyy-MM-dd HH:mm:ss.SSS` style pattern.
///
/// | letters | meaning |
/// |---|---|
/// | `G` | era, always `AD` |
/// | `yyyy` `yy` | year |
/// | `M` `MM` `MMM` `MMMM` | month: `1`, `01`, `Jan`, `January` |
/// | `d` `dd` | day of month |
/// | `EEE` `EEEE` | weekday: `Mon`, `Monday` |
/// | `H` `HH` | hour of day |
/// | `h` `hh` `a` | hour on a 12-hour clock and `AM`/`PM` |
/// | `m` `mm` `s` `ss` | minute and second |
/// | `S`..`SSSSSSSSS` | leading digits of the fraction of a second |
/// | `z` `Z` `X` `XX` `XXX` | zone: `UTC`, `+0000`, `+00`, `+0000`, `+00:00` |
///
/// Any other character is copied.
pub fn format_time(t: DateTime<Utc>, pattern: &str) -> Result<String, String> {
    let mut out = String::with_capacity(pattern.len() + 8);
    for (c, n) in pattern_runs(pattern) {
        match (c, n) {
            ('G', _) => out.push_str("AD"),
            ('y', 4) => out.push_str(&format!("{:04}", t.year())),
            ('y', 2) => out.push_str(&format!("{:02}", t.year().rem_euclid(100))),
            ('y', _) => return Err(format!("invalid time format {} for year", "y".repeat(n))),
            ('M', 1) => out.push_str(&t.month().to_string()),
            ('M', 2) => out.push_str(&format!("{:02}", t.month())),
            ('M', 3) => out.push_str(&MONTHS[t.month0() as usize][..3]),
            ('M', _) => out.push_str(MONTHS[t.month0() as usize]),
            ('d', 1) => out.push_str(&t.day().to_string()),
            ('d', _) => out.push_str(&format!("{:02}", t.day())),
            ('E', 3) => out.push_str(
                &WEEKDAYS[t.weekday().num_days_from_sunday() as usize][..3],
            ),
            ('E', 4) => out.push_str(WEEKDAYS[t.weekday().num_days_from_sunday() as usize]),
            ('E', _) => return Err(format!("invalid time format {} for weekday", "E".repeat(n))),
            ('H', 1) => out.push_str(&t.hour().to_string()),
            ('H', _) => out.push_str(&format!("{:02}", t.hour())),
            ('h', 1) => out.push_str(&t.hour12().1.to_string()),
            ('h', _) => out.push_str(&format!("{:02}", t.hour12().1)),
            ('a', _) => out.push_str(if t.hour12().0 { "PM" } else { "AM" }),
            ('m', 1) => out.push_str(&t.minute().to_string()),
            ('m', _) => out.push_str(&format!("{:02}", t.minute())),
            ('s', 1) => out.push_str(&t.second().to_string()),
            ('s', _) => out.push_str(&format!("{:02}", t.second())),
            ('S', _) => {
                let digits = format!("{:09}", t.nanosecond() % 1_000_000_000);
                out.push_str(&digits[..n.min(9)]);
            }
            ('z', _) => out.push_str("UTC"),
            ('Z', _) => out.push_str("+0000"),
            ('X', 1) => out.push_str("+00"),
            ('X', 2) => out.push_str("+0000"),
            ('X', _) => out.push_str("+00:00"),
            _ => out.extend(std::iter::repeat(c).take(n)),
        }
    }
    Ok(out)
}

/// Parse a duration such as `300ms`, `-1.5h` or `1h30m`.
///
/// Units are `ns`, `us`, `ms`, `s`, `m` and `h`; parts add up.
pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
    let invalid = || format!("invalid duration {:?}", s);
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if body.is_empty() {
        return Err(invalid());
    }
    let mut total_ns: i128 = 0;
    let mut rest = body;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let number: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale: f64 = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total_ns += (number * scale) as i128;
    }
    let total_ns = i64::try_from(total_ns).map_err(|_| invalid())?;
    let d = Duration::nanoseconds(total_ns);
    Ok(if negative { -d } else { d })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn call_ok(name: &str, args: &[Value]) -> Value {
        call(name, args).unwrap_or_else(|e| panic!("{} failed: {}", name, e))
    }

    #[test]
    fn test_format_time_patterns() {
        let t = at("2024-03-05T14:07:09.123456Z");
        assert_eq!(
            format_time(t, "yyyy-MM-dd HH:mm:ss.SSS").unwrap(),
            "2024-03-05 14:07:09.123"
        );
        assert_eq!(format_time(t, "yy/M/d h:m:s a").unwrap(), "24/3/5 2:7:9 PM");
        assert_eq!(format_time(t, "EEE, MMM d").unwrap(), "Tue, Mar 5");
        assert_eq!(format_time(t, "EEEE MMMM G").unwrap(), "Tuesday March AD");
        assert_eq!(format_time(t, "HH:mm XXX z").unwrap(), "14:07 +00:00 UTC");
        assert_eq!(format_time(t, "SSSSSS").unwrap(), "123456");
        assert!(format_time(t, "yyy").is_err());
    }

    #[test]
    fn test_datetime_arguments() {
        let expected = at("2024-03-05T14:07:09Z");
        assert_eq!(to_time(&Value::Int(1_709_647_629_000)).unwrap(), expected);
        assert_eq!(to_time(&Value::from("2024-03-05T14:07:09Z")).unwrap(), expected);
        assert_eq!(to_time(&Value::from("2024-03-05 14:07:09")).unwrap(), expected);
        assert_eq!(
            to_time(&Value::Bool(true)).unwrap_err(),
            "unsupported type to convert to timestamp bool(true)"
        );
        assert!(to_time(&Value::from("yesterday")).is_err());
    }

    #[test]
    fn test_calendar_fields() {
        let t = [Value::Time(at("2024-12-31T23:59:58.000250Z"))];
        assert_eq!(call_ok("day_name", &t), Value::from("Tuesday"));
        assert_eq!(call_ok("day_of_week", &t), Value::Int(2));
        assert_eq!(call_ok("day_of_year", &t), Value::Int(366));
        assert_eq!(call_ok("day", &t), Value::Int(31));
        assert_eq!(call_ok("month", &t), Value::Int(12));
        assert_eq!(call_ok("month_name", &t), Value::from("December"));
        assert_eq!(call_ok("hour", &t), Value::Int(23));
        assert_eq!(call_ok("minute", &t), Value::Int(59));
        assert_eq!(call_ok("second", &t), Value::Int(58));
        assert_eq!(call_ok("microsecond", &t), Value::Int(250));
        assert_eq!(call_ok("last_day", &t), Value::from("2024-12-31"));
        let feb = [Value::from("2024-02-10 00:00:00")];
        assert_eq!(call_ok("last_day", &feb), Value::from("2024-02-29"));
    }

    #[test]
    fn test_date_calc_and_diff() {
        let t = Value::from("2024-03-05 14:07:09");
        assert_eq!(
            call_ok("date_calc", &[t.clone(), "1h30m".into()]),
            Value::from("2024-03-05 15:37:09")
        );
        assert_eq!(
            call_ok("date_calc", &[t.clone(), "-15h".into()]),
            Value::from("2024-03-04 23:07:09")
        );
        assert!(call("date_calc", &[t.clone(), "1d".into()]).is_err());
        assert_eq!(
            call_ok("date_diff", &[Value::Int(1_000), Value::Int(3_500)]),
            Value::Int(2_500_000_000)
        );
        assert_eq!(
            call_ok("date_diff", &[Value::Int(3_500), Value::Int(1_000)]),
            Value::Int(-2_500_000_000)
        );
    }

    #[test]
    fn test_day_and_unix_conversions() {
        assert_eq!(call_ok("from_days", &[Value::Int(1)]), Value::from("1970-01-01"));
        assert_eq!(call_ok("from_days", &[Value::Int(32)]), Value::from("1970-02-01"));
        assert_eq!(call_ok("from_days", &[Value::Int(0)]), Value::Null);
        assert_eq!(call_ok("from_days", &[Value::Null]), Value::Null);
        assert_eq!(
            call_ok("from_unix_time", &[Value::Int(1_709_647_629)]),
            Value::from("2024-03-05 14:07:09")
        );
        assert_eq!(call_ok("from_unix_time", &[Value::Int(0)]), Value::Null);
        assert!(call("from_unix_time", &["x".into()]).is_err());
    }

    #[test]
    fn test_current_time_shapes() {
        let Value::Str(now) = call_ok("now", &[]) else {
            panic!("now is not a string");
        };
        assert_eq!(now.len(), "yyyy-MM-dd HH:mm:ss".len());
        let Value::Str(time) = call_ok("cur_time", &[Value::Int(3)]) else {
            panic!("cur_time is not a string");
        };
        assert_eq!(time.len(), "HH:mm:ss.SSS".len());
        let Value::Str(date) = call_ok("cur_date", &[]) else {
            panic!("cur_date is not a string");
        };
        assert_eq!(date.len(), 10);
        assert!(call("now", &[Value::Int(9)]).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("300ms").unwrap(), Duration::milliseconds(300));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("-2m3s").unwrap(), -Duration::seconds(123));
        assert_eq!(parse_duration("10us").unwrap(), Duration::microseconds(10));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("h").is_err());
    }
}
