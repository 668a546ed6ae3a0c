//! Interval catalog: the time granularities tracked for every event
//!
//! Each [`Granularity`] turns a timestamp into a canonical bucket label. The
//! label always starts with the granularity name, so a day bucket can never
//! collide with a month bucket of the same event.
//!
//! ```text
//! minute  → minute:2024-03-09T14:05
//! hour    → hour:2024-03-09T14
//! day     → day:2024-03-09
//! week    → week:2024-W10        (ISO 8601 week)
//! month   → month:2024-03
//! year    → year:2024
//! all     → all                  (single lifetime bucket)
//! ```
//!
//! All labels are computed in UTC.
//!
//! # Example
//!
//! ```rust
//! use bitesized::interval::{Granularity, IntervalCatalog};
//! use chrono::{TimeZone, Utc};
//!
//! let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 30).unwrap();
//! assert_eq!(Granularity::Day.label(at), "day:2024-03-09");
//!
//! let catalog = IntervalCatalog::default();
//! assert_eq!(catalog.labels(at).len(), 5);
//! ```

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SECS_PER_DAY: i64 = 86_400;

/// A time granularity with a deterministic bucket label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One bucket per UTC minute
    Minute,
    /// One bucket per UTC hour
    Hour,
    /// One bucket per UTC calendar day
    Day,
    /// One bucket per ISO week (Monday start)
    Week,
    /// One bucket per calendar month
    Month,
    /// One bucket per calendar year
    Year,
    /// A single bucket covering all time
    All,
}

impl Granularity {
    /// Every supported granularity, finest first
    pub const ALL_GRANULARITIES: [Granularity; 7] = [
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
        Granularity::Year,
        Granularity::All,
    ];

    /// Lowercase name, also the label prefix
    pub fn name(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
            Granularity::All => "all",
        }
    }

    /// Canonical label of the bucket containing `at`
    pub fn label(&self, at: DateTime<Utc>) -> String {
        match self {
            Granularity::Minute => at.format("minute:%Y-%m-%dT%H:%M").to_string(),
            Granularity::Hour => at.format("hour:%Y-%m-%dT%H").to_string(),
            Granularity::Day => at.format("day:%Y-%m-%d").to_string(),
            Granularity::Week => {
                let week = at.iso_week();
                format!("week:{:04}-W{:02}", week.year(), week.week())
            },
            Granularity::Month => at.format("month:%Y-%m").to_string(),
            Granularity::Year => at.format("year:%Y").to_string(),
            Granularity::All => "all".to_string(),
        }
    }

    /// First instant of the bucket containing `at`
    ///
    /// Returns `None` for [`Granularity::All`], which has no start.
    pub fn bucket_start(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = at.timestamp();
        match self {
            Granularity::Minute => DateTime::from_timestamp(secs - secs.rem_euclid(60), 0),
            Granularity::Hour => DateTime::from_timestamp(secs - secs.rem_euclid(3_600), 0),
            Granularity::Day => DateTime::from_timestamp(secs - secs.rem_euclid(SECS_PER_DAY), 0),
            Granularity::Week => {
                let days = secs.div_euclid(SECS_PER_DAY);
                // 1970-01-01 was a Thursday; shift so Monday is 0
                let weekday = (days + 3).rem_euclid(7);
                DateTime::from_timestamp((days - weekday) * SECS_PER_DAY, 0)
            },
            Granularity::Month => {
                NaiveDate::from_ymd_opt(at.year(), at.month(), 1).map(midnight_utc)
            },
            Granularity::Year => NaiveDate::from_ymd_opt(at.year(), 1, 1).map(midnight_utc),
            Granularity::All => None,
        }
    }

    /// Start of the bucket following the one that starts at `start`
    pub fn next_bucket(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Granularity::Minute => start.checked_add_signed(Duration::minutes(1)),
            Granularity::Hour => start.checked_add_signed(Duration::hours(1)),
            Granularity::Day => start.checked_add_signed(Duration::days(1)),
            Granularity::Week => start.checked_add_signed(Duration::weeks(1)),
            Granularity::Month => start.checked_add_months(Months::new(1)),
            Granularity::Year => start.checked_add_months(Months::new(12)),
            Granularity::All => None,
        }
    }

    /// Bucket starts from the bucket of `from` through the bucket of `till`
    ///
    /// Fails with [`Error::InvalidArgument`] as soon as the range holds more
    /// than `limit` buckets, without walking the rest of it.
    pub fn buckets_between(
        &self,
        from: DateTime<Utc>,
        till: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DateTime<Utc>>> {
        if from > till {
            return Err(Error::InvalidArgument(format!(
                "range start {} is after end {}",
                from, till
            )));
        }
        let mut current = self.bucket_start(from).ok_or_else(|| {
            Error::InvalidArgument(format!("granularity '{}' has no buckets to step", self))
        })?;

        let mut buckets = Vec::new();
        while current <= till {
            if buckets.len() == limit {
                return Err(Error::InvalidArgument(format!(
                    "range from {} to {} holds more than {} {} buckets",
                    from, till, limit, self
                )));
            }
            buckets.push(current);
            current = match self.next_bucket(current) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(buckets)
    }
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Granularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Granularity::ALL_GRANULARITIES
            .iter()
            .copied()
            .find(|g| g.name() == wanted)
            .ok_or_else(|| Error::Configuration(format!("unknown interval '{}'", s.trim())))
    }
}

/// Ordered, duplicate-free list of tracked granularities
///
/// Immutable once built; the recorder writes one bit per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalCatalog {
    intervals: Vec<Granularity>,
}

impl IntervalCatalog {
    /// Build a catalog, rejecting duplicate granularities
    pub fn new(intervals: Vec<Granularity>) -> Result<Self> {
        for (i, g) in intervals.iter().enumerate() {
            if intervals[..i].contains(g) {
                return Err(Error::Configuration(format!(
                    "interval '{}' listed more than once",
                    g
                )));
            }
        }
        Ok(Self { intervals })
    }

    /// Parse a comma separated list such as `"day,week,month"`
    pub fn parse_list(list: &str) -> Result<Self> {
        let intervals = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Granularity>>>()?;
        Self::new(intervals)
    }

    /// Configured granularities in order
    pub fn granularities(&self) -> &[Granularity] {
        &self.intervals
    }

    /// Whether `granularity` is tracked
    pub fn contains(&self, granularity: Granularity) -> bool {
        self.intervals.contains(&granularity)
    }

    /// Number of granularities
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// True when nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// One bucket label per configured granularity, in catalog order
    pub fn labels(&self, at: DateTime<Utc>) -> Vec<(Granularity, String)> {
        self.intervals.iter().map(|g| (*g, g.label(at))).collect()
    }
}

impl Default for IntervalCatalog {
    /// `hour, day, week, month, year`
    fn default() -> Self {
        Self {
            intervals: vec![
                Granularity::Hour,
                Granularity::Day,
                Granularity::Week,
                Granularity::Month,
                Granularity::Year,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_label_formats() {
        let t = at(2024, 3, 9, 14, 5, 30);
        assert_eq!(Granularity::Minute.label(t), "minute:2024-03-09T14:05");
        assert_eq!(Granularity::Hour.label(t), "hour:2024-03-09T14");
        assert_eq!(Granularity::Day.label(t), "day:2024-03-09");
        assert_eq!(Granularity::Week.label(t), "week:2024-W10");
        assert_eq!(Granularity::Month.label(t), "month:2024-03");
        assert_eq!(Granularity::Year.label(t), "year:2024");
        assert_eq!(Granularity::All.label(t), "all");
    }

    #[test]
    fn test_same_bucket_same_label() {
        let early = at(2024, 3, 9, 0, 0, 0);
        let late = at(2024, 3, 9, 23, 59, 59);
        assert_eq!(Granularity::Day.label(early), Granularity::Day.label(late));
        assert_ne!(Granularity::Hour.label(early), Granularity::Hour.label(late));
    }

    #[test]
    fn test_iso_week_crosses_year() {
        // 2021-01-01 belongs to ISO week 53 of 2020
        assert_eq!(Granularity::Week.label(at(2021, 1, 1, 12, 0, 0)), "week:2020-W53");
        // 2024-12-30 belongs to ISO week 1 of 2025
        assert_eq!(Granularity::Week.label(at(2024, 12, 30, 0, 0, 0)), "week:2025-W01");
    }

    #[test]
    fn test_bucket_start() {
        let t = at(2024, 3, 9, 14, 5, 30);
        assert_eq!(Granularity::Minute.bucket_start(t), Some(at(2024, 3, 9, 14, 5, 0)));
        assert_eq!(Granularity::Hour.bucket_start(t), Some(at(2024, 3, 9, 14, 0, 0)));
        assert_eq!(Granularity::Day.bucket_start(t), Some(at(2024, 3, 9, 0, 0, 0)));
        // 2024-03-09 is a Saturday, its ISO week starts Monday 2024-03-04
        assert_eq!(Granularity::Week.bucket_start(t), Some(at(2024, 3, 4, 0, 0, 0)));
        assert_eq!(Granularity::Month.bucket_start(t), Some(at(2024, 3, 1, 0, 0, 0)));
        assert_eq!(Granularity::Year.bucket_start(t), Some(at(2024, 1, 1, 0, 0, 0)));
        assert_eq!(Granularity::All.bucket_start(t), None);
    }

    #[test]
    fn test_bucket_start_before_epoch() {
        let t = at(1969, 12, 31, 23, 30, 0);
        assert_eq!(Granularity::Day.bucket_start(t), Some(at(1969, 12, 31, 0, 0, 0)));
        // 1969-12-31 was a Wednesday
        assert_eq!(Granularity::Week.bucket_start(t), Some(at(1969, 12, 29, 0, 0, 0)));
    }

    #[test]
    fn test_next_bucket_month_lengths() {
        let jan = at(2024, 1, 1, 0, 0, 0);
        let feb = Granularity::Month.next_bucket(jan).unwrap();
        assert_eq!(feb, at(2024, 2, 1, 0, 0, 0));
        let mar = Granularity::Month.next_bucket(feb).unwrap();
        assert_eq!(mar, at(2024, 3, 1, 0, 0, 0));
        assert_eq!(Granularity::All.next_bucket(jan), None);
    }

    #[test]
    fn test_buckets_between() {
        let from = at(2024, 3, 1, 10, 0, 0);
        let till = at(2024, 3, 4, 9, 0, 0);
        let days = Granularity::Day.buckets_between(from, till, 10).unwrap();
        assert_eq!(days.len(), 4);
        assert_eq!(days[0], at(2024, 3, 1, 0, 0, 0));
        assert_eq!(days[3], at(2024, 3, 4, 0, 0, 0));

        assert!(Granularity::Day.buckets_between(till, from, 10).is_err());
        assert!(Granularity::All.buckets_between(from, till, 10).is_err());
    }

    #[test]
    fn test_buckets_between_limit() {
        let from = at(2024, 3, 1, 0, 0, 0);
        let till = at(2024, 3, 4, 0, 0, 0);
        assert_eq!(Granularity::Day.buckets_between(from, till, 4).unwrap().len(), 4);
        assert!(matches!(
            Granularity::Day.buckets_between(from, till, 3),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_buckets_between_stops_at_limit() {
        // Half a century of minutes; only limit + 1 buckets are ever visited
        let from = at(1970, 1, 1, 0, 0, 0);
        let till = at(2024, 1, 1, 0, 0, 0);
        let start = std::time::Instant::now();
        assert!(Granularity::Minute.buckets_between(from, till, 512).is_err());
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_parse_granularity() {
        assert_eq!("Day".parse::<Granularity>().unwrap(), Granularity::Day);
        assert_eq!(" week ".parse::<Granularity>().unwrap(), Granularity::Week);
        assert!(matches!(
            "fortnight".parse::<Granularity>(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_catalog_default() {
        let catalog = IntervalCatalog::default();
        assert_eq!(
            catalog.granularities(),
            &[
                Granularity::Hour,
                Granularity::Day,
                Granularity::Week,
                Granularity::Month,
                Granularity::Year
            ]
        );
        assert!(!catalog.contains(Granularity::Minute));
    }

    #[test]
    fn test_catalog_rejects_duplicates() {
        let result = IntervalCatalog::new(vec![Granularity::Day, Granularity::Day]);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_catalog_parse_list() {
        let catalog = IntervalCatalog::parse_list("day, month,all").unwrap();
        assert_eq!(
            catalog.granularities(),
            &[Granularity::Day, Granularity::Month, Granularity::All]
        );
        assert!(IntervalCatalog::parse_list("").unwrap().is_empty());
        assert!(IntervalCatalog::parse_list("day,decade").is_err());
    }

    #[test]
    fn test_catalog_labels_in_order() {
        let catalog = IntervalCatalog::new(vec![Granularity::Year, Granularity::Day]).unwrap();
        let labels = catalog.labels(at(2023, 7, 4, 8, 0, 0));
        assert_eq!(
            labels,
            vec![
                (Granularity::Year, "year:2023".to_string()),
                (Granularity::Day, "day:2023-07-04".to_string()),
            ]
        );
    }
}
