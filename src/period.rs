use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate};
use regex::Regex;

use crate::date_util::last_day_of_month;
use crate::error::{Error, Result};

static RE_MONTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})$").unwrap());

/// The reporting period every rollup row is bucketed by: one calendar month.
///
/// Deliberately a pure value type: nothing in this module reads the clock.
/// Callers (CLI, HTTP handlers, batch jobs) resolve "today" exactly once at
/// the boundary and pass it down, so concurrent triggers agree on the bucket
/// and the aggregation engine stays testable with fixed dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Period {
    start: NaiveDate,
    end: NaiveDate,
}

impl Period {
    /// The calendar month for a given year/month pair.
    pub fn month(year: i32, month: u32) -> Result<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| Error::PeriodParse(format!("invalid month: {year}-{month:02}")))?;
        Ok(Self {
            start,
            end: last_day_of_month(year, month),
        })
    }

    /// The period containing `date`.
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            start: date.with_day(1).unwrap(),
            end: last_day_of_month(date.year(), date.month()),
        }
    }

    /// The current reporting period as of `today`.
    pub fn current(today: NaiveDate) -> Self {
        Self::containing(today)
    }

    /// The reporting period immediately before the one containing `today`.
    pub fn previous(today: NaiveDate) -> Self {
        let first = today.with_day(1).unwrap();
        Self::containing(first - Duration::days(1))
    }

    /// Parse a `YYYY-MM` period key.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(caps) = RE_MONTH.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let month: u32 = caps[2].parse().unwrap();
            if (1..=12).contains(&month) {
                return Self::month(year, month);
            }
        }
        Err(Error::PeriodParse(format!("unrecognized period: {s}")))
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Canonical key string, e.g. `2026-08`.
    pub fn key(&self) -> String {
        format!("{}-{:02}", self.start.year(), self.start.month())
    }

    /// Date-key strings for SQL range filters (inclusive).
    pub fn date_keys(&self) -> (String, String) {
        (
            self.start.format("%Y-%m-%d").to_string(),
            self.end.format("%Y-%m-%d").to_string(),
        )
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}
