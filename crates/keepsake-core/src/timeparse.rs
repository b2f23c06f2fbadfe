//! Natural-language time expressions
//!
//! Resolves expressions like `yesterday`, `last week`, `this month`,
//! `last 3 weeks`, `last-2-weeks`, or `5 days ago` into an inclusive
//! `[start, end]` pair of UTC seconds-since-epoch floats. ISO weeks start
//! on Monday; months are calendar months.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use thiserror::Error;

/// Time-expression parsing error
#[derive(Debug, Error)]
pub enum TimeParseError {
    /// The expression was not recognized
    #[error("Unrecognized time expression: '{0}'")]
    Unrecognized(String),
    /// Numeric component failed to parse
    #[error("Invalid count in time expression '{0}'")]
    InvalidCount(String),
}

/// Resolved UTC time range; either bound may be open
pub type TimeRange = (Option<f64>, Option<f64>);

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is valid"))
}

fn to_ts(dt: DateTime<Utc>) -> f64 {
    dt.timestamp() as f64
}

fn week_start(date: NaiveDate) -> NaiveDate {
    let offset = date.weekday().num_days_from_monday() as i64;
    date - Duration::days(offset)
}

fn month_start(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month is valid")
}

fn prev_month_start(date: NaiveDate) -> NaiveDate {
    let first = month_start(date);
    if first.month() == 1 {
        NaiveDate::from_ymd_opt(first.year() - 1, 12, 1).expect("december exists")
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() - 1, 1).expect("previous month exists")
    }
}

/// Parse a natural-language time expression relative to `now`.
///
/// Unknown expressions are rejected with a precise message rather than
/// silently matching everything.
pub fn parse_time_expression_at(expr: &str, now: DateTime<Utc>) -> Result<TimeRange, TimeParseError> {
    let normalized = expr.trim().to_lowercase().replace('-', " ");
    let today = now.date_naive();

    match normalized.as_str() {
        "today" => {
            return Ok((Some(to_ts(day_start(today))), Some(to_ts(now))));
        }
        "yesterday" => {
            let start = day_start(today - Duration::days(1));
            let end = day_start(today);
            return Ok((Some(to_ts(start)), Some(to_ts(end) - 1.0)));
        }
        "this week" => {
            return Ok((Some(to_ts(day_start(week_start(today)))), Some(to_ts(now))));
        }
        "last week" => {
            let this_week = week_start(today);
            let start = day_start(this_week - Duration::days(7));
            let end = day_start(this_week);
            return Ok((Some(to_ts(start)), Some(to_ts(end) - 1.0)));
        }
        "this month" => {
            return Ok((Some(to_ts(day_start(month_start(today)))), Some(to_ts(now))));
        }
        "last month" => {
            let start = day_start(prev_month_start(today));
            let end = day_start(month_start(today));
            return Ok((Some(to_ts(start)), Some(to_ts(end) - 1.0)));
        }
        _ => {}
    }

    let words: Vec<&str> = normalized.split_whitespace().collect();

    // "last N days|weeks|months" (also reached via the hyphenated form)
    if words.len() == 3 && words[0] == "last" {
        let count: i64 = words[1]
            .parse()
            .map_err(|_| TimeParseError::InvalidCount(expr.to_string()))?;
        let days = match words[2] {
            "day" | "days" => count,
            "week" | "weeks" => count * 7,
            "month" | "months" => count * 30,
            _ => return Err(TimeParseError::Unrecognized(expr.to_string())),
        };
        let start = now - Duration::days(days);
        return Ok((Some(to_ts(start)), Some(to_ts(now))));
    }

    // "N days|weeks|months ago" resolves to that single day
    if words.len() == 3 && words[2] == "ago" {
        let count: i64 = words[0]
            .parse()
            .map_err(|_| TimeParseError::InvalidCount(expr.to_string()))?;
        let days = match words[1] {
            "day" | "days" => count,
            "week" | "weeks" => count * 7,
            "month" | "months" => count * 30,
            _ => return Err(TimeParseError::Unrecognized(expr.to_string())),
        };
        let that_day = today - Duration::days(days);
        let start = day_start(that_day);
        let end = day_start(that_day + Duration::days(1));
        return Ok((Some(to_ts(start)), Some(to_ts(end) - 1.0)));
    }

    Err(TimeParseError::Unrecognized(expr.to_string()))
}

/// Parse a time expression relative to the current UTC time
pub fn parse_time_expression(expr: &str) -> Result<TimeRange, TimeParseError> {
    parse_time_expression_at(expr, Utc::now())
}

/// Parse an ISO `YYYY-MM-DD` date into the timestamp at UTC midnight
pub fn parse_iso_date(date: &str) -> Result<f64, String> {
    NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map(|d| to_ts(day_start(d)))
        .map_err(|_| format!("Invalid date format: {date}. Use YYYY-MM-DD"))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        // Wednesday 2024-06-12 15:30:00 UTC
        Utc.with_ymd_and_hms(2024, 6, 12, 15, 30, 0).unwrap()
    }

    #[test]
    fn test_yesterday() {
        let (start, end) = parse_time_expression_at("yesterday", fixed_now()).unwrap();
        let start = start.unwrap();
        let end = end.unwrap();
        let day = 86_400.0;
        assert!((end - start - (day - 1.0)).abs() < 2.0);
        let expected_start = Utc.with_ymd_and_hms(2024, 6, 11, 0, 0, 0).unwrap();
        assert_eq!(start, expected_start.timestamp() as f64);
    }

    #[test]
    fn test_last_week_is_previous_iso_week() {
        let (start, end) = parse_time_expression_at("last week", fixed_now()).unwrap();
        // Previous Monday..Sunday: 2024-06-03 through 2024-06-09
        let expected_start = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        assert_eq!(start.unwrap(), expected_start.timestamp() as f64);
        let expected_end = Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap();
        assert_eq!(end.unwrap(), expected_end.timestamp() as f64 - 1.0);
    }

    #[test]
    fn test_this_month() {
        let (start, end) = parse_time_expression_at("this month", fixed_now()).unwrap();
        let expected_start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(start.unwrap(), expected_start.timestamp() as f64);
        assert_eq!(end.unwrap(), fixed_now().timestamp() as f64);
    }

    #[test]
    fn test_last_month_spans_calendar_month() {
        let (start, end) = parse_time_expression_at("last month", fixed_now()).unwrap();
        let expected_start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(start.unwrap(), expected_start.timestamp() as f64);
        assert!(end.unwrap() < fixed_now().timestamp() as f64);
    }

    #[test]
    fn test_last_n_weeks_and_hyphen_form() {
        let a = parse_time_expression_at("last 2 weeks", fixed_now()).unwrap();
        let b = parse_time_expression_at("last-2-weeks", fixed_now()).unwrap();
        assert_eq!(a, b);
        let span = a.1.unwrap() - a.0.unwrap();
        assert!((span - 14.0 * 86_400.0).abs() < 2.0);
    }

    #[test]
    fn test_n_days_ago_single_day() {
        let (start, end) = parse_time_expression_at("3 days ago", fixed_now()).unwrap();
        let expected_start = Utc.with_ymd_and_hms(2024, 6, 9, 0, 0, 0).unwrap();
        assert_eq!(start.unwrap(), expected_start.timestamp() as f64);
        assert!((end.unwrap() - start.unwrap() - (86_400.0 - 1.0)).abs() < 2.0);
    }

    #[test]
    fn test_unrecognized_rejected() {
        assert!(parse_time_expression_at("the before times", fixed_now()).is_err());
        assert!(parse_time_expression_at("last banana weeks", fixed_now()).is_err());
        assert!(parse_time_expression_at("last x days", fixed_now()).is_err());
    }

    #[test]
    fn test_iso_date() {
        let ts = parse_iso_date("2024-01-15").unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(ts, expected.timestamp() as f64);
        assert!(parse_iso_date("01/15/2024").is_err());
    }
}
