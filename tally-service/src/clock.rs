//! Calendar arithmetic shared by every tally pass.
//!
//! [`ApplicationClock::start_of_range`] is the only function that maps a timestamp
//! to the start of its period. Snapshot materialization and rollup grouping both
//! go through it, so a coarse bucket can never be computed two different ways.

use crate::models::Granularity;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplicationClock {
    fixed: Option<DateTime<Utc>>,
}

impl ApplicationClock {
    pub fn system() -> Self {
        Self { fixed: None }
    }

    /// Clock pinned to `now`, for tests and replays.
    pub fn fixed(now: DateTime<Utc>) -> Self {
        Self { fixed: Some(now) }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.fixed.unwrap_or_else(Utc::now)
    }

    pub fn start_of_current_hour(&self) -> DateTime<Utc> {
        Self::start_of_hour(self.now())
    }

    pub fn start_of_today(&self) -> DateTime<Utc> {
        Self::start_of_day(self.now())
    }

    pub fn start_of_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
        midnight(ts.date_naive()) + Duration::hours(ts.hour() as i64)
    }

    pub fn start_of_day(ts: DateTime<Utc>) -> DateTime<Utc> {
        midnight(ts.date_naive())
    }

    /// Weeks start on Sunday.
    pub fn start_of_week(ts: DateTime<Utc>) -> DateTime<Utc> {
        let days_since_sunday = ts.weekday().num_days_from_sunday() as i64;
        Self::start_of_day(ts) - Duration::days(days_since_sunday)
    }

    pub fn start_of_month(ts: DateTime<Utc>) -> DateTime<Utc> {
        first_of(ts.year(), ts.month())
    }

    pub fn start_of_quarter(ts: DateTime<Utc>) -> DateTime<Utc> {
        let quarter_month = ((ts.month() - 1) / 3) * 3 + 1;
        first_of(ts.year(), quarter_month)
    }

    pub fn start_of_year(ts: DateTime<Utc>) -> DateTime<Utc> {
        first_of(ts.year(), 1)
    }

    pub fn start_of_range(granularity: Granularity, ts: DateTime<Utc>) -> DateTime<Utc> {
        match granularity {
            Granularity::Hourly => Self::start_of_hour(ts),
            Granularity::Daily => Self::start_of_day(ts),
            Granularity::Weekly => Self::start_of_week(ts),
            Granularity::Monthly => Self::start_of_month(ts),
            Granularity::Quarterly => Self::start_of_quarter(ts),
            Granularity::Yearly => Self::start_of_year(ts),
        }
    }

    /// Start of the period following the one containing `ts`.
    pub fn start_of_next_range(granularity: Granularity, ts: DateTime<Utc>) -> DateTime<Utc> {
        let start = Self::start_of_range(granularity, ts);
        match granularity {
            Granularity::Hourly => start + Duration::hours(1),
            Granularity::Daily => start + Duration::days(1),
            Granularity::Weekly => start + Duration::weeks(1),
            Granularity::Monthly => add_months(start, 1),
            Granularity::Quarterly => add_months(start, 3),
            Granularity::Yearly => add_months(start, 12),
        }
    }

    /// Last microsecond of the period containing `ts`.
    pub fn end_of_range(granularity: Granularity, ts: DateTime<Utc>) -> DateTime<Utc> {
        Self::start_of_next_range(granularity, ts) - Duration::microseconds(1)
    }

    /// Every period start of `granularity` whose period intersects `[start, end]`.
    pub fn period_starts(
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let mut starts = Vec::new();
        let mut cursor = Self::start_of_range(granularity, start);
        while cursor <= end {
            starts.push(cursor);
            cursor = Self::start_of_next_range(granularity, cursor);
        }
        starts
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

fn first_of(year: i32, month: u32) -> DateTime<Utc> {
    // Month is always 1..=12 here, so the date exists.
    let date = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN);
    midnight(date)
}

fn add_months(start_of_month: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    let zero_based = start_of_month.month0() + months;
    first_of(
        start_of_month.year() + (zero_based / 12) as i32,
        zero_based % 12 + 1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 27, 13).unwrap()
    }

    #[test]
    fn weeks_start_on_sunday() {
        // 2024-03-06 is a Wednesday.
        assert_eq!(
            ApplicationClock::start_of_week(ts(2024, 3, 6, 10)),
            Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap()
        );
        // A Sunday is its own week start.
        assert_eq!(
            ApplicationClock::start_of_week(ts(2024, 3, 3, 23)),
            Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn quarters_and_years() {
        assert_eq!(
            ApplicationClock::start_of_quarter(ts(2024, 8, 15, 0)),
            Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            ApplicationClock::end_of_range(Granularity::Quarterly, ts(2024, 11, 2, 0)),
            Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap() + Duration::microseconds(999_999)
        );
        assert_eq!(
            ApplicationClock::start_of_next_range(Granularity::Yearly, ts(2024, 5, 1, 0)),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn december_rolls_into_next_year() {
        assert_eq!(
            ApplicationClock::start_of_next_range(Granularity::Monthly, ts(2023, 12, 31, 23)),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn period_starts_cover_the_range() {
        let starts = ApplicationClock::period_starts(
            Granularity::Hourly,
            ts(2024, 1, 1, 22),
            ts(2024, 1, 2, 1),
        );
        assert_eq!(starts.len(), 4);
        assert_eq!(starts[0], Utc.with_ymd_and_hms(2024, 1, 1, 22, 0, 0).unwrap());
    }

    #[test]
    fn fixed_clock_is_stable() {
        let now = ts(2024, 2, 29, 13);
        let clock = ApplicationClock::fixed(now);
        assert_eq!(clock.now(), now);
        assert_eq!(
            clock.start_of_current_hour(),
            Utc.with_ymd_and_hms(2024, 2, 29, 13, 0, 0).unwrap()
        );
    }
}
