//! Cron expression evaluator.
//! Supports: "MIN HOUR DOM MON DOW" (5-field) or "SEC MIN HOUR DOM MON DOW" (6-field)
//! Syntax per field: *, ?, N, A-B, */N, A-B/N, N/S and comma lists.
//! Month (JAN-DEC) and weekday (SUN-SAT) names are accepted; 7 is also Sunday.
//! Macros: @yearly, @monthly, @weekly, @daily, @hourly.
//! Example: "0 8 * * MON-FRI" = weekdays at 8:00
//!
//! All times are evaluated in UTC.

use chrono::{DateTime, Datelike, Duration, DurationRound, NaiveDate, Timelike, Utc};

use flowcron_core::error::{FlowError, Result};
use flowcron_core::traits::TriggerEvaluator;

/// How far ahead to search before giving up (e.g. "0 0 30 2 *").
const SEARCH_HORIZON_DAYS: i64 = 5 * 366;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expanded = match expression.trim() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };
        let parts: Vec<&str> = expanded.split_whitespace().collect();
        let (sec, rest) = match parts.len() {
            5 => ("0", &parts[..]),
            6 => (parts[0], &parts[1..]),
            n => {
                return Err(FlowError::InvalidTrigger(format!(
                    "'{expression}' has {n} fields, expected 5 (MIN HOUR DOM MON DOW) or 6 (SEC first)"
                )));
            }
        };

        let field = |spec: &str, min: u32, max: u32, names: &[&str], name_base: u32| {
            parse_field(spec, min, max, names, name_base).map_err(|reason| {
                FlowError::InvalidTrigger(format!("'{expression}': field '{spec}' {reason}"))
            })
        };

        let mut days_of_week = field(rest[4], 0, 7, DAY_NAMES, 0)?;
        // 7 is an alias for Sunday
        if days_of_week.contains(7) {
            days_of_week = FieldSet((days_of_week.0 & !(1 << 7)) | 1);
        }

        Ok(Self {
            seconds: field(sec, 0, 59, &[], 0)?,
            minutes: field(rest[0], 0, 59, &[], 0)?,
            hours: field(rest[1], 0, 23, &[], 0)?,
            days_of_month: field(rest[2], 1, 31, &[], 0)?,
            months: field(rest[3], 1, 12, MONTH_NAMES, 1)?,
            days_of_week,
            dom_restricted: !is_wildcard(rest[2]),
            dow_restricted: !is_wildcard(rest[4]),
        })
    }

    /// First matching instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let horizon = after + Duration::days(SEARCH_HORIZON_DAYS);
        let mut t = after.duration_trunc(Duration::seconds(1)).ok()? + Duration::seconds(1);

        while t <= horizon {
            if !self.months.contains(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_next_day(t)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    /// When both day fields are restricted, either may match.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(t.day());
        let dow = self.days_of_week.contains(t.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

fn is_wildcard(spec: &str) -> bool {
    spec == "*" || spec == "?"
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc())
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 { (t.year() + 1, 1) } else { (t.year(), t.month() + 1) };
    Some(NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Parse one field into a bitmask of allowed values.
fn parse_field(
    spec: &str,
    min: u32,
    max: u32,
    names: &[&str],
    name_base: u32,
) -> std::result::Result<FieldSet, String> {
    let mut bits = 0u64;
    for part in spec.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| format!("has a bad step '{step}'"))?;
                if step == 0 {
                    return Err("has a zero step".into());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if is_wildcard(range) {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names, name_base)?, parse_value(b, names, name_base)?)
        } else {
            let v = parse_value(range, names, name_base)?;
            // "5/15" means "from 5, every 15"
            if step.is_some() { (v, max) } else { (v, v) }
        };

        if lo < min || hi > max {
            return Err(format!("is out of range {min}-{max}"));
        }
        if lo > hi {
            return Err(format!("has an inverted range {lo}-{hi}"));
        }
        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            bits |= 1u64 << v;
        }
    }
    Ok(FieldSet(bits))
}

fn parse_value(raw: &str, names: &[&str], name_base: u32) -> std::result::Result<u32, String> {
    if let Ok(n) = raw.parse::<u32>() {
        return Ok(n);
    }
    let upper = raw.to_ascii_uppercase();
    names
        .iter()
        .position(|name| *name == upper)
        .map(|idx| idx as u32 + name_base)
        .ok_or_else(|| format!("has an unknown value '{raw}'"))
}

/// `TriggerEvaluator` backed by [`CronSchedule`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CronEvaluator;

impl CronEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl TriggerEvaluator for CronEvaluator {
    fn next_fire_time(
        &self,
        expression: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(CronSchedule::parse(expression)?.next_after(after))
    }

    fn validate(&self, expression: &str) -> Result<()> {
        CronSchedule::parse(expression).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Weekday};

    fn next(expr: &str, after: DateTime<Utc>) -> DateTime<Utc> {
        CronSchedule::parse(expr).unwrap().next_after(after).unwrap()
    }

    #[test]
    fn test_every_hour() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 30, 0).unwrap();
        let next = next("0 * * * *", after);
        assert_eq!(next.hour(), 11);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_specific_time() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 7, 0, 0).unwrap();
        let next = next("0 8 * * *", after);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 22, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_every_15_minutes() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 2, 0).unwrap();
        assert_eq!(next("*/15 * * * *", after).minute(), 15);
    }

    #[test]
    fn test_exact_match_is_not_returned() {
        let at = Utc.with_ymd_and_hms(2026, 2, 22, 8, 0, 0).unwrap();
        assert_eq!(next("0 8 * * *", at), Utc.with_ymd_and_hms(2026, 2, 23, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_six_fields_with_seconds() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 7).unwrap();
        assert_eq!(next("*/20 * * * * *", after), Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 20).unwrap());
    }

    #[test]
    fn test_weekday_names_and_ranges() {
        // 2026-02-21 is a Saturday
        let after = Utc.with_ymd_and_hms(2026, 2, 21, 12, 0, 0).unwrap();
        let next = next("30 9 * * MON-FRI", after);
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!((next.hour(), next.minute()), (9, 30));
    }

    #[test]
    fn test_sunday_as_seven() {
        let after = Utc.with_ymd_and_hms(2026, 2, 21, 12, 0, 0).unwrap();
        assert_eq!(next("0 0 * * 7", after).weekday(), Weekday::Sun);
    }

    #[test]
    fn test_month_names_and_rollover() {
        let after = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(next("0 0 1 jan *", after), Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // the 15th, or any Monday
        let after = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        let first = next("0 0 15 * MON", after);
        assert_eq!(first, Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0).unwrap());
        let second = next("0 0 15 * MON", first);
        assert_eq!(second.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_stepped_range_and_lists() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 31, 0).unwrap();
        assert_eq!(next("10-50/20 * * * *", after).minute(), 50);
        assert_eq!(next("5,45 * * * *", after).minute(), 45);
    }

    #[test]
    fn test_macros() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 31, 0).unwrap();
        assert_eq!(next("@daily", after), Utc.with_ymd_and_hms(2026, 2, 23, 0, 0, 0).unwrap());
        assert_eq!(next("@hourly", after).hour(), 11);
    }

    #[test]
    fn test_impossible_date_never_fires() {
        let schedule = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert!(schedule.next_after(Utc::now()).is_none());
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in ["bad", "61 * * * *", "* * * *", "*/0 * * * *", "5-1 * * * *", "0 0 * FOO *"] {
            assert!(
                matches!(CronSchedule::parse(bad), Err(FlowError::InvalidTrigger(_))),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn test_successive_fire_times_strictly_increase() {
        let evaluator = CronEvaluator::new();
        for expr in ["* * * * *", "*/7 3-5 * * *", "0 0 29 2 *", "15 10 * * SAT,SUN"] {
            let mut t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
            for _ in 0..10 {
                let n = evaluator.next_fire_time(expr, t).unwrap().unwrap();
                assert!(n > t, "{expr}: {n} !> {t}");
                t = n;
            }
        }
    }

    #[test]
    fn test_subsecond_after_still_advances() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 59).unwrap() + Duration::milliseconds(500);
        assert_eq!(next("* * * * *", after), Utc.with_ymd_and_hms(2026, 2, 22, 10, 1, 0).unwrap());
    }
}
